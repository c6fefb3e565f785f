use chrono::{DateTime, Utc};
use rand::Rng;
use rollcalld::db::Store;
use rollcalld::error::EngineError;
use rollcalld::gateway;
use rollcalld::ledger::{self, AttendanceStatus, Channel};
use rollcalld::session;
use std::sync::Barrier;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn at(ts: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(ts)
        .expect("test timestamp")
        .with_timezone(&Utc)
}

/// In-memory store with one class (2030-03-09, 09:00-10:30) and
/// `enrolled` students named s0..sN.
fn seed_store(enrolled: usize) -> (Store, String, Vec<String>) {
    let store = Store::open_in_memory().expect("open store");
    let class_id = "c1".to_string();
    let mut student_ids = Vec::new();
    {
        let conn = store.conn().expect("conn");
        conn.execute(
            "INSERT INTO class_instances (id, subject, section, room, scheduled_start, scheduled_end, late_threshold_minutes)
             VALUES (?1, 'Math', '1A', NULL, '2030-03-09T09:00:00.000000Z', '2030-03-09T10:30:00.000000Z', 10)",
            [&class_id],
        )
        .expect("insert class");
        for i in 0..enrolled {
            let sid = format!("s{}", i);
            conn.execute(
                "INSERT INTO students (id, last_name, first_name, student_no) VALUES (?1, ?2, 'Test', NULL)",
                rusqlite::params![sid, format!("Student{}", i)],
            )
            .expect("insert student");
            conn.execute(
                "INSERT INTO enrollments (class_instance_id, student_id) VALUES (?1, ?2)",
                rusqlite::params![class_id, sid],
            )
            .expect("insert enrollment");
            student_ids.push(sid);
        }
    }
    (store, class_id, student_ids)
}

#[test]
fn same_student_hammering_yields_one_record() {
    let (store, class_id, students) = seed_store(1);
    let session = session::open(&store, &class_id, at("2030-03-09T09:01:00Z")).expect("open");
    let student = students[0].clone();

    let threads = 8;
    let barrier = Arc::new(Barrier::new(threads));
    let mut handles = Vec::new();
    for _ in 0..threads {
        let store = store.clone();
        let code = session.code.clone();
        let student = student.clone();
        let barrier = Arc::clone(&barrier);
        handles.push(thread::spawn(move || {
            barrier.wait();
            gateway::redeem_by_code(&store, &code, &student, at("2030-03-09T09:05:00Z"))
        }));
    }

    let mut ok = 0;
    let mut duplicates = 0;
    for handle in handles {
        match handle.join().expect("join") {
            Ok(_) => ok += 1,
            Err(EngineError::AlreadyRecorded) => duplicates += 1,
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert_eq!(ok, 1);
    assert_eq!(duplicates, threads - 1);

    let conn = store.conn().expect("conn");
    let rows = ledger::list(&conn, &session.id).expect("list");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].status, AttendanceStatus::Present);
    assert_eq!(rows[0].channel, Channel::Redeemed);
}

#[test]
fn close_racing_redemptions_leaves_one_record_per_student() {
    let enrolled = 24;
    let (store, class_id, students) = seed_store(enrolled);
    let session = session::open(&store, &class_id, at("2030-03-09T09:01:00Z")).expect("open");
    let session_id = session.id.clone();

    let barrier = Arc::new(Barrier::new(enrolled + 1));
    let mut handles = Vec::new();
    for student in &students {
        let store = store.clone();
        let code = session.code.clone();
        let student = student.clone();
        let barrier = Arc::clone(&barrier);
        handles.push(thread::spawn(move || {
            barrier.wait();
            thread::sleep(Duration::from_micros(
                rand::thread_rng().gen_range(0..500),
            ));
            (
                student.clone(),
                gateway::redeem_by_code(&store, &code, &student, at("2030-03-09T09:05:00Z")),
            )
        }));
    }

    let closer = {
        let store = store.clone();
        let session_id = session_id.clone();
        let barrier = Arc::clone(&barrier);
        thread::spawn(move || {
            barrier.wait();
            thread::sleep(Duration::from_micros(
                rand::thread_rng().gen_range(0..500),
            ));
            session::close(&store, &session_id, at("2030-03-09T09:06:00Z")).expect("close")
        })
    };

    let mut redeemed = Vec::new();
    let mut bounced = Vec::new();
    for handle in handles {
        let (student, outcome) = handle.join().expect("join");
        match outcome {
            Ok(_) => redeemed.push(student),
            Err(EngineError::WindowClosed) => bounced.push(student),
            Err(other) => panic!("unexpected error for {student}: {other}"),
        }
    }
    let summary = closer.join().expect("join closer");

    // However the race falls, the ledger holds exactly one row per
    // student and each row agrees with what the student was told.
    let conn = store.conn().expect("conn");
    let rows = ledger::list(&conn, &session_id).expect("list");
    assert_eq!(rows.len(), enrolled);
    for student in &redeemed {
        let row = rows
            .iter()
            .find(|r| &r.student_id == student)
            .expect("row for redeemed student");
        assert_eq!(row.status, AttendanceStatus::Present);
        assert_eq!(row.channel, Channel::Redeemed);
    }
    for student in &bounced {
        let row = rows
            .iter()
            .find(|r| &r.student_id == student)
            .expect("row for bounced student");
        assert_eq!(row.status, AttendanceStatus::Absent);
        assert_eq!(row.channel, Channel::AutoAbsent);
    }

    assert_eq!(summary.present as usize, redeemed.len());
    assert_eq!(summary.absent as usize, bounced.len());
    assert_eq!(summary.auto_absent, summary.absent);
    assert_eq!(summary.present + summary.absent, enrolled as i64);
}
