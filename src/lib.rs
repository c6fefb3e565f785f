pub mod backup;
pub mod credentials;
pub mod db;
pub mod error;
pub mod gateway;
pub mod ipc;
pub mod ledger;
pub mod roster;
pub mod schedule;
pub mod session;
pub mod timer;
