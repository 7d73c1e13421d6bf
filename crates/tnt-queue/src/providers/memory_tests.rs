//! Tests for the in-memory queue server.

use super::*;
use std::thread;
use std::time::Instant;

fn params(protocol: Protocol) -> ConnectParams {
    ConnectParams {
        host: "localhost".to_string(),
        port: 33013,
        schema: None,
        protocol,
    }
}

fn connect(server: &InMemoryServer) -> Arc<dyn Connection> {
    server.connect(&params(Protocol::Standard)).unwrap()
}

fn connect_limited(server: &InMemoryServer) -> Arc<dyn Connection> {
    server.connect(&params(Protocol::Limited)).unwrap()
}

/// Limited-protocol put into tube `t` with a one second lease
fn put_limited(conn: &Arc<dyn Connection>, payload: &str, limits: u64, retry: u64) -> CallResponse {
    let args = [
        Arg::from(0u32),
        Arg::from("t"),
        Arg::from(limits),
        Arg::from(0u32),
        Arg::from(0u64),
        Arg::from(1u64),
        Arg::from(0u64),
        Arg::from(retry),
        Arg::from(Bytes::copy_from_slice(payload.as_bytes())),
    ];
    conn.call(Verb::Put, &args).unwrap()
}

fn put(conn: &Arc<dyn Connection>, tube: &str, payload: &str, pri: u32) -> TaskId {
    put_with(conn, Verb::Put, tube, payload, 0, pri)
}

fn put_with(
    conn: &Arc<dyn Connection>,
    verb: Verb,
    tube: &str,
    payload: &str,
    delay: u64,
    pri: u32,
) -> TaskId {
    let args = [
        Arg::from(0u32),
        Arg::from(tube),
        Arg::from(delay),
        Arg::from(0u64),
        Arg::from(0u64),
        Arg::from(pri),
        Arg::from(Bytes::copy_from_slice(payload.as_bytes())),
    ];
    let response = conn.call(verb, &args).unwrap();
    TaskId::from(response.rows[0][0].as_text().unwrap())
}

fn take(conn: &Arc<dyn Connection>, tube: &str, timeout: f64) -> Option<Row> {
    let args = [Arg::from(0u32), Arg::from(tube), Arg::Float(timeout)];
    conn.call(Verb::Take, &args).unwrap().rows.into_iter().next()
}

fn on_task(conn: &Arc<dyn Connection>, verb: Verb, id: &TaskId) -> CallResponse {
    conn.call(verb, &[Arg::from(0u32), Arg::from(id.as_str())])
        .unwrap()
}

fn payload_of(row: &Row) -> &str {
    row[3].as_text().unwrap()
}

mod ordering {
    use super::*;

    /// Verify normal tasks are served by priority, then insertion order.
    #[test]
    fn test_priority_then_fifo() {
        let server = InMemoryServer::new();
        let conn = connect(&server);
        put(&conn, "t", "low-1", 5);
        put(&conn, "t", "high", 1);
        put(&conn, "t", "low-2", 5);

        let order: Vec<String> = (0..3)
            .map(|_| payload_of(&take(&conn, "t", 0.0).unwrap()).to_string())
            .collect();
        assert_eq!(order, vec!["high", "low-1", "low-2"]);
    }

    /// Verify urgent tasks jump the queue, most recent first.
    #[test]
    fn test_urgent_most_recent_first() {
        let server = InMemoryServer::new();
        let conn = connect(&server);
        put(&conn, "t", "normal", 0);
        put_with(&conn, Verb::Urgent, "t", "A", 0, 0);
        put_with(&conn, Verb::Urgent, "t", "B", 0, 0);

        let order: Vec<String> = (0..3)
            .map(|_| payload_of(&take(&conn, "t", 0.0).unwrap()).to_string())
            .collect();
        assert_eq!(order, vec!["B", "A", "normal"]);
    }

    /// Verify requeue moves a task behind every ready task.
    #[test]
    fn test_requeue_goes_to_tail() {
        let server = InMemoryServer::new();
        let conn = connect(&server);
        put(&conn, "t", "first", 0);
        put(&conn, "t", "second", 0);

        let first = take(&conn, "t", 0.0).unwrap();
        let id = TaskId::from(first[0].as_text().unwrap());
        assert!(on_task(&conn, Verb::Requeue, &id).is_success());

        assert_eq!(payload_of(&take(&conn, "t", 0.0).unwrap()), "second");
        assert_eq!(payload_of(&take(&conn, "t", 0.0).unwrap()), "first");
    }

    /// Verify a requeued high-priority task waits behind low-priority ones.
    #[test]
    fn test_requeue_ignores_priority() {
        let server = InMemoryServer::new();
        let conn = connect(&server);
        let x = put(&conn, "t", "X", 0);
        put(&conn, "t", "Y", 5);

        take(&conn, "t", 0.0).unwrap();
        assert!(on_task(&conn, Verb::Requeue, &x).is_success());
        put(&conn, "t", "Z", 9);

        let order: Vec<String> = (0..3)
            .map(|_| payload_of(&take(&conn, "t", 0.0).unwrap()).to_string())
            .collect();
        assert_eq!(order, vec!["Y", "Z", "X"]);
    }
}

mod transitions {
    use super::*;

    /// Verify only the connection holding the lease may settle it.
    #[test]
    fn test_lease_belongs_to_taker() {
        let server = InMemoryServer::new();
        let owner = connect(&server);
        let other = connect(&server);
        let id = put(&owner, "t", "x", 0);
        take(&owner, "t", 0.0).unwrap();

        for verb in [Verb::Ack, Verb::Release, Verb::Touch] {
            assert_eq!(on_task(&other, verb, &id).return_code, ILLEGAL_TRANSITION);
        }
        assert_eq!(server.task_status(&id), Some(TaskStatus::Taken));

        assert!(on_task(&owner, Verb::Ack, &id).is_success());
    }

    /// Verify ack removes a taken task and is illegal on a ready one.
    #[test]
    fn test_ack() {
        let server = InMemoryServer::new();
        let conn = connect(&server);
        let id = put(&conn, "t", "x", 0);

        assert_eq!(
            on_task(&conn, Verb::Ack, &id).return_code,
            ILLEGAL_TRANSITION
        );

        take(&conn, "t", 0.0).unwrap();
        assert!(on_task(&conn, Verb::Ack, &id).is_success());
        assert_eq!(server.task_status(&id), None);
        assert!(take(&conn, "t", 0.0).is_none());
    }

    /// Verify done keeps the task with its replacement payload.
    #[test]
    fn test_done_keeps_task() {
        let server = InMemoryServer::new();
        let conn = connect(&server);
        let id = put(&conn, "t", "in", 0);
        take(&conn, "t", 0.0).unwrap();

        let args = [
            Arg::from(0u32),
            Arg::from(id.as_str()),
            Arg::from(Bytes::from_static(b"out")),
        ];
        assert!(conn.call(Verb::Done, &args).unwrap().is_success());

        assert_eq!(server.task_status(&id), Some(TaskStatus::Done));
        let peeked = on_task(&conn, Verb::Peek, &id);
        assert_eq!(payload_of(&peeked.rows[0]), "out");
    }

    /// Verify bury, kick and dig move tasks in and out of the buried set.
    #[test]
    fn test_bury_kick_dig() {
        let server = InMemoryServer::new();
        let conn = connect(&server);
        let a = put(&conn, "t", "a", 0);
        let b = put(&conn, "t", "b", 0);

        assert!(on_task(&conn, Verb::Bury, &a).is_success());
        assert!(on_task(&conn, Verb::Bury, &b).is_success());
        assert_eq!(server.task_status(&a), Some(TaskStatus::Buried));

        let kick = [Arg::from(0u32), Arg::from("t"), Arg::from(1u32)];
        let kicked = conn.call(Verb::Kick, &kick).unwrap();
        assert_eq!(kicked.rows[0][0].as_text(), Some("1"));
        assert_eq!(server.task_status(&a), Some(TaskStatus::Ready));
        assert_eq!(server.task_status(&b), Some(TaskStatus::Buried));

        assert!(on_task(&conn, Verb::Dig, &b).is_success());
        assert!(!on_task(&conn, Verb::Dig, &b).is_success());
    }

    /// Verify release with a delay parks the task until it is due.
    #[test]
    fn test_release_with_delay() {
        let server = InMemoryServer::new();
        let conn = connect(&server);
        let id = put(&conn, "t", "x", 0);
        take(&conn, "t", 0.0).unwrap();

        let args = [
            Arg::from(0u32),
            Arg::from(id.as_str()),
            Arg::from(60u64),
            Arg::from(0u64),
        ];
        let released = conn.call(Verb::Release, &args).unwrap();
        assert_eq!(released.rows[0][2].as_text(), Some("delayed"));
        assert!(take(&conn, "t", 0.0).is_none());
    }

    /// Verify operations on unknown tasks are illegal, not errors.
    #[test]
    fn test_unknown_task() {
        let server = InMemoryServer::new();
        let conn = connect(&server);
        let id = TaskId::from("missing");

        let response = on_task(&conn, Verb::Delete, &id);
        assert_eq!(response.return_code, ILLEGAL_TRANSITION);
        assert!(response.rows.is_empty());
    }

    /// Verify tasks are invisible from other spaces.
    #[test]
    fn test_space_isolation() {
        let server = InMemoryServer::new();
        let conn = connect(&server);
        let id = put(&conn, "t", "x", 0);

        let args = [Arg::from(1u32), Arg::from(id.as_str())];
        assert!(!conn.call(Verb::Peek, &args).unwrap().is_success());
        let take_other = [Arg::from(1u32), Arg::from("t"), Arg::Float(0.0)];
        assert!(conn.call(Verb::Take, &take_other).unwrap().rows.is_empty());
    }
}

mod timing {
    use super::*;

    /// Verify a delayed task becomes ready on its own.
    #[test]
    fn test_delay_elapses() {
        let server = InMemoryServer::new();
        let conn = connect(&server);
        let id = put_with(&conn, Verb::Put, "t", "x", 1, 0);
        assert_eq!(server.task_status(&id), Some(TaskStatus::Delayed));

        let row = take(&conn, "t", 3.0).unwrap();
        assert_eq!(row[0].as_text(), Some(id.as_str()));
    }

    /// Verify a zero timeout polls once without waiting.
    #[test]
    fn test_zero_timeout_polls() {
        let server = InMemoryServer::new();
        let conn = connect(&server);

        let started = Instant::now();
        assert!(take(&conn, "t", 0.0).is_none());
        assert!(started.elapsed() < Duration::from_millis(500));
    }

    /// Verify a blocked take wakes up when another connection puts a task.
    #[test]
    fn test_take_wakes_on_put() {
        let server = InMemoryServer::new();
        let consumer = connect(&server);
        let producer = connect(&server);

        let handle = thread::spawn(move || take(&consumer, "t", 5.0));
        thread::sleep(Duration::from_millis(50));
        put(&producer, "t", "hello", 0);

        let row = handle.join().unwrap().unwrap();
        assert_eq!(payload_of(&row), "hello");
    }

    /// Verify an expired lease returns the task to ready.
    #[test]
    fn test_lease_expiry() {
        let server = InMemoryServer::new();
        let conn = connect(&server);
        let args = [
            Arg::from(0u32),
            Arg::from("t"),
            Arg::from(0u64),
            Arg::from(0u64),
            Arg::from(1u64),
            Arg::from(0u32),
            Arg::from(Bytes::from_static(b"x")),
        ];
        conn.call(Verb::Put, &args).unwrap();

        assert!(take(&conn, "t", 0.0).is_some());
        assert!(take(&conn, "t", 3.0).is_some());
    }
}

mod introspection {
    use super::*;

    /// Verify meta rows carry 13 fields with fixed-width integers.
    #[test]
    fn test_meta_row_layout() {
        let server = InMemoryServer::new();
        let conn = connect(&server);
        let cid = {
            let id = put(&conn, "t", "x", 4);
            take(&conn, "t", 0.0).unwrap();
            let meta = on_task(&conn, Verb::Meta, &id);
            let row = &meta.rows[0];
            assert_eq!(row.len(), 13);
            assert_eq!(row[2].as_text(), Some("taken"));
            assert_eq!(row[5].as_text(), Some("4"));
            assert_eq!(row[11].as_i64_le(), Some(1));
            row[6].as_i32_le().unwrap()
        };
        assert!(cid > 0);
    }

    /// Verify counters and gauges are reported for every space.
    #[test]
    fn test_statistics_keys() {
        let server = InMemoryServer::new();
        let conn = connect(&server);
        put(&conn, "t", "x", 0);

        let response = conn.call(Verb::Statistics, &[Arg::from(0u32)]).unwrap();
        let pairs = crate::StatsAggregator::pairs_from_row(&response.rows[0]).unwrap();
        let flat: BTreeMap<String, String> = pairs.into_iter().collect();

        assert_eq!(flat.get("space0.t.put").map(String::as_str), Some("1"));
        assert_eq!(flat.get("space0.t.tasks.ready").map(String::as_str), Some("1"));
        assert_eq!(flat.get("space0.t.tasks.total").map(String::as_str), Some("1"));
        assert_eq!(flat.get("space0.t.tasks.buried").map(String::as_str), Some("0"));
    }
}

mod faults {
    use super::*;

    /// Verify injected failures hit exactly one call.
    #[test]
    fn test_fail_next() {
        let server = InMemoryServer::new();
        let conn = connect(&server);
        server.fail_next(Verb::Put);

        let args = [
            Arg::from(0u32),
            Arg::from("t"),
            Arg::from(0u64),
            Arg::from(0u64),
            Arg::from(0u64),
            Arg::from(0u32),
            Arg::from(Bytes::from_static(b"x")),
        ];
        let err = conn.call(Verb::Put, &args).unwrap_err();
        assert!(err.is_transient());
        assert!(conn.call(Verb::Put, &args).is_ok());
    }

    /// Verify removed verbs are reported as unsupported.
    #[test]
    fn test_without_verb() {
        let server = InMemoryServer::new().without_verb(Verb::Kick);
        let conn = connect(&server);

        assert!(!conn.supports(Verb::Kick));
        assert!(conn.supports(Verb::Put));
    }

    /// Verify each connection gets its own id.
    #[test]
    fn test_connection_ids() {
        let server = InMemoryServer::new();
        connect(&server);
        connect(&server);
        assert_eq!(server.connection_count(), 2);
    }
}

mod limited {
    use super::*;

    /// Verify a limited put answers with a 64-bit id and take with a nine-field row.
    #[test]
    fn test_limited_rows() {
        let server = InMemoryServer::new();
        let conn = connect_limited(&server);

        let put = put_limited(&conn, "x", 10, 5);
        assert_eq!(put.rows[0].len(), 1);
        let number = put.rows[0][0].as_i64_le().unwrap();

        let row = take(&conn, "t", 0.0).unwrap();
        assert_eq!(row.len(), 9);
        assert_eq!(row[0].as_i64_le(), Some(number));
        assert_eq!(row[4].as_text(), Some("t"));
        assert_eq!(row[8].as_text(), Some("x"));
        assert_eq!(
            server.task_status(&TaskId::from(number)),
            Some(TaskStatus::Taken)
        );
    }

    /// Verify a tube at capacity refuses further puts.
    #[test]
    fn test_limits_cap_the_tube() {
        let server = InMemoryServer::new();
        let conn = connect_limited(&server);

        assert!(put_limited(&conn, "a", 2, 5).is_success());
        assert!(put_limited(&conn, "b", 2, 5).is_success());
        let full = put_limited(&conn, "c", 2, 5);

        assert_eq!(full.return_code, TUBE_FULL);
        assert!(full.rows.is_empty());
        assert_eq!(server.task_count(), 2);
    }

    /// Verify a task is buried once its retries are used up.
    #[test]
    fn test_retry_exhaustion_buries() {
        let server = InMemoryServer::new();
        let conn = connect_limited(&server);
        put_limited(&conn, "x", 10, 1);

        for _ in 0..2 {
            let row = take(&conn, "t", 0.0).unwrap();
            let id = TaskId::from(row[0].as_i64_le().unwrap());
            let args = [Arg::from(0u32), Arg::from(id.as_str())];
            conn.call(Verb::Release, &args).unwrap();
        }

        assert!(take(&conn, "t", 0.0).is_none());
        let stats = connect(&server)
            .call(Verb::Statistics, &[Arg::from(0u32)])
            .unwrap();
        let pairs = crate::StatsAggregator::pairs_from_row(&stats.rows[0]).unwrap();
        let flat: BTreeMap<String, String> = pairs.into_iter().collect();
        assert_eq!(flat.get("space0.t.tasks.buried").map(String::as_str), Some("1"));
    }

    /// Verify verbs outside the limited family are not defined.
    #[test]
    fn test_limited_verbs_only() {
        let server = InMemoryServer::new();
        let conn = connect_limited(&server);

        assert!(conn.supports(Verb::Take));
        assert!(!conn.supports(Verb::Kick));
        let err = conn.call(Verb::Kick, &[Arg::from(0u32), Arg::from("t")]).unwrap_err();
        assert!(err.to_string().contains("box.queue.kick"));
    }
}
