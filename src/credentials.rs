use rand::Rng;
use uuid::Uuid;

use crate::error::EngineError;

/// Token/code pair handed to the front-end when a session opens. The token
/// goes into the scannable payload; the code is read out loud or written on
/// the board.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub token: String,
    pub code: String,
}

pub const CODE_LEN: usize = 6;

/// Uppercase alphanumerics; redemption normalizes case so the alphabet only
/// needs one casing.
const CODE_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

const MAX_CODE_ATTEMPTS: usize = 16;

/// Canonical form of a human-entered code: surrounding whitespace dropped,
/// uppercased.
pub fn normalize_code(raw: &str) -> String {
    raw.trim().to_ascii_uppercase()
}

/// Issue a fresh credential pair. `code_in_use` is consulted so the short
/// code cannot collide with another currently-active session; on collision
/// we regenerate, giving up after a bounded number of attempts.
///
/// Nothing is persisted here; the caller stores the pair as part of the
/// session row.
pub fn issue<F>(mut code_in_use: F) -> Result<Credentials, EngineError>
where
    F: FnMut(&str) -> Result<bool, EngineError>,
{
    let token = Uuid::new_v4().to_string();
    let mut rng = rand::thread_rng();

    for _ in 0..MAX_CODE_ATTEMPTS {
        let code: String = (0..CODE_LEN)
            .map(|_| CODE_ALPHABET[rng.gen_range(0..CODE_ALPHABET.len())] as char)
            .collect();
        if !code_in_use(&code)? {
            return Ok(Credentials { token, code });
        }
    }
    Err(EngineError::CodeAllocation(MAX_CODE_ATTEMPTS))
}
