//! Integration tests: start a real server, speak the wire protocol over a
//! TCP socket, and verify the exact packet sequences.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use byteorder::{BigEndian, ByteOrder};

use corvus_core::catalog::Catalog;
use corvus_core::storage::TupleStore;
use corvus_core::tcop::TrafficCop;
use corvus_core::txn::TransactionManager;
use corvus_core::types::{CcConfig, CcStrategy};
use corvus_server::CorvusServer;

/// Start a server with the given strategy on an ephemeral port.
fn start_server(strategy: CcStrategy) -> SocketAddr {
    let config = CcConfig {
        strategy,
        occ_serializable: false,
        lock_wait_timeout: Duration::from_millis(5000),
    };
    let catalog = Arc::new(Catalog::new());
    let store = Arc::new(TupleStore::new());
    let tm = Arc::new(TransactionManager::new(&config, Arc::clone(&store)));
    let tcop = Arc::new(TrafficCop::new(catalog, store, tm));

    let server = CorvusServer::bind("127.0.0.1:0", tcop, 64).unwrap();
    let addr = server.local_addr().unwrap();
    thread::spawn(move || {
        let _ = server.run();
    });
    addr
}

type Message = (u8, Vec<u8>);

struct TestClient {
    stream: TcpStream,
}

impl TestClient {
    fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).unwrap();
        stream.set_nodelay(true).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(10)))
            .unwrap();
        Self { stream }
    }

    /// v3 startup with user/database; returns everything up to ReadyForQuery.
    fn startup(&mut self) -> Vec<Message> {
        self.send_startup(3 << 16, &[("user", "postgres"), ("database", "test")]);
        self.read_until_ready()
    }

    fn send_startup(&mut self, version: i32, pairs: &[(&str, &str)]) {
        let mut body = Vec::new();
        body.extend_from_slice(&version.to_be_bytes());
        for (key, value) in pairs {
            body.extend_from_slice(key.as_bytes());
            body.push(0);
            body.extend_from_slice(value.as_bytes());
            body.push(0);
        }
        body.push(0);

        let mut wire = Vec::new();
        wire.extend_from_slice(&(body.len() as u32 + 4).to_be_bytes());
        wire.extend_from_slice(&body);
        self.stream.write_all(&wire).unwrap();
    }

    fn send(&mut self, msg_type: u8, body: &[u8]) {
        let mut wire = vec![msg_type];
        wire.extend_from_slice(&(body.len() as u32 + 4).to_be_bytes());
        wire.extend_from_slice(body);
        self.stream.write_all(&wire).unwrap();
    }

    fn query(&mut self, sql: &str) -> Vec<Message> {
        let mut body = sql.as_bytes().to_vec();
        body.push(0);
        self.send(b'Q', &body);
        self.read_until_ready()
    }

    fn parse(&mut self, name: &str, sql: &str, param_oids: &[i32]) {
        let mut body = Vec::new();
        body.extend_from_slice(name.as_bytes());
        body.push(0);
        body.extend_from_slice(sql.as_bytes());
        body.push(0);
        body.extend_from_slice(&(param_oids.len() as i16).to_be_bytes());
        for oid in param_oids {
            body.extend_from_slice(&oid.to_be_bytes());
        }
        self.send(b'P', &body);
    }

    fn bind(&mut self, portal: &str, statement: &str, params: &[(i16, Option<&[u8]>)]) {
        let mut body = Vec::new();
        body.extend_from_slice(portal.as_bytes());
        body.push(0);
        body.extend_from_slice(statement.as_bytes());
        body.push(0);
        body.extend_from_slice(&(params.len() as i16).to_be_bytes());
        for (format, _) in params {
            body.extend_from_slice(&format.to_be_bytes());
        }
        body.extend_from_slice(&(params.len() as i16).to_be_bytes());
        for (_, value) in params {
            match value {
                None => body.extend_from_slice(&(-1i32).to_be_bytes()),
                Some(bytes) => {
                    body.extend_from_slice(&(bytes.len() as i32).to_be_bytes());
                    body.extend_from_slice(bytes);
                }
            }
        }
        body.extend_from_slice(&0i16.to_be_bytes());
        self.send(b'B', &body);
    }

    fn describe_portal(&mut self, name: &str) {
        let mut body = vec![b'P'];
        body.extend_from_slice(name.as_bytes());
        body.push(0);
        self.send(b'D', &body);
    }

    fn execute(&mut self, portal: &str) {
        let mut body = portal.as_bytes().to_vec();
        body.push(0);
        body.extend_from_slice(&0i32.to_be_bytes());
        self.send(b'E', &body);
    }

    fn sync(&mut self) -> Vec<Message> {
        self.send(b'S', &[]);
        self.read_until_ready()
    }

    fn read_message(&mut self) -> Option<Message> {
        let mut tag = [0u8; 1];
        match self.stream.read_exact(&mut tag) {
            Ok(()) => {}
            Err(_) => return None,
        }
        let mut header = [0u8; 4];
        self.stream.read_exact(&mut header).unwrap();
        let length = BigEndian::read_u32(&header) as usize;
        let mut body = vec![0u8; length - 4];
        self.stream.read_exact(&mut body).unwrap();
        Some((tag[0], body))
    }

    fn read_until_ready(&mut self) -> Vec<Message> {
        let mut messages = Vec::new();
        loop {
            let message = self.read_message().expect("connection closed early");
            let done = message.0 == b'Z';
            messages.push(message);
            if done {
                return messages;
            }
        }
    }
}

fn cstring_at(body: &[u8]) -> String {
    let nul = body.iter().position(|b| *b == 0).unwrap();
    String::from_utf8(body[..nul].to_vec()).unwrap()
}

/// Command tags of every CommandComplete packet in a response.
fn command_tags(messages: &[Message]) -> Vec<String> {
    messages
        .iter()
        .filter(|(t, _)| *t == b'C')
        .map(|(_, body)| cstring_at(body))
        .collect()
}

/// Single-column text values of every DataRow packet in a response.
fn data_values(messages: &[Message]) -> Vec<Option<String>> {
    messages
        .iter()
        .filter(|(t, _)| *t == b'D')
        .map(|(_, body)| {
            let columns = BigEndian::read_i16(&body[0..2]);
            assert_eq!(columns, 1, "expected single-column rows");
            let length = BigEndian::read_i32(&body[2..6]);
            if length < 0 {
                None
            } else {
                Some(String::from_utf8(body[6..6 + length as usize].to_vec()).unwrap())
            }
        })
        .collect()
}

fn ready_status(messages: &[Message]) -> u8 {
    let (tag, body) = messages.last().unwrap();
    assert_eq!(*tag, b'Z');
    body[0]
}

const EXPECTED_PARAMETER_STATUS: &[(&str, &str)] = &[
    ("application_name", "psql"),
    ("client_encoding", "UTF8"),
    ("DateStyle", "ISO, MDY"),
    ("integer_datetimes", "on"),
    ("IntervalStyle", "postgres"),
    ("is_superuser", "on"),
    ("server_encoding", "UTF8"),
    ("server_version", "9.5devel"),
    ("session_authorization", "postgres"),
    ("standard_conforming_strings", "on"),
    ("TimeZone", "US/Eastern"),
];

#[test]
fn test_s1_startup_sequence() {
    let addr = start_server(CcStrategy::Occ);
    let mut client = TestClient::connect(addr);
    let messages = client.startup();

    assert_eq!(messages.len(), 13);
    assert_eq!(messages[0].0, b'R');
    assert_eq!(BigEndian::read_i32(&messages[0].1), 0);

    for (index, (key, value)) in EXPECTED_PARAMETER_STATUS.iter().enumerate() {
        let (tag, body) = &messages[1 + index];
        assert_eq!(*tag, b'S');
        let nul = body.iter().position(|b| *b == 0).unwrap();
        assert_eq!(&body[..nul], key.as_bytes());
        assert_eq!(cstring_at(&body[nul + 1..]), *value);
    }

    assert_eq!(messages[12], (b'Z', vec![b'I']));
}

#[test]
fn test_protocol_version_mismatch_closes_session() {
    let addr = start_server(CcStrategy::Occ);
    let mut client = TestClient::connect(addr);
    client.send_startup(2 << 16, &[("user", "postgres")]);
    assert!(
        client.read_message().is_none(),
        "server must close without sending packets"
    );
}

#[test]
fn test_s2_simple_select() {
    let addr = start_server(CcStrategy::Occ);
    let mut client = TestClient::connect(addr);
    client.startup();

    client.query("CREATE TABLE t (a int)");
    client.query("INSERT INTO t VALUES (0)");
    let messages = client.query("SELECT a FROM t;");

    let (tag, body) = &messages[0];
    assert_eq!(*tag, b'T');
    assert_eq!(BigEndian::read_i16(&body[0..2]), 1);
    assert_eq!(cstring_at(&body[2..]), "a");
    // After the name: table oid (4), attnum (2), then the type oid.
    let after_name = 2 + 2 /* "a\0" */;
    assert_eq!(BigEndian::read_i32(&body[after_name + 6..after_name + 10]), 23);

    assert_eq!(data_values(&messages), vec![Some("0".to_string())]);
    assert_eq!(command_tags(&messages), vec!["SELECT 1"]);
    assert_eq!(ready_status(&messages), b'I');
}

#[test]
fn test_s3_implicit_insert_transaction() {
    let addr = start_server(CcStrategy::Occ);
    let mut client = TestClient::connect(addr);
    client.startup();

    client.query("CREATE TABLE t (a int)");
    let messages = client.query("INSERT INTO t VALUES (7);");
    assert_eq!(command_tags(&messages), vec!["INSERT 0 1"]);
    assert_eq!(ready_status(&messages), b'I');

    // Immediately visible to a subsequent statement.
    let messages = client.query("SELECT a FROM t");
    assert_eq!(data_values(&messages), vec![Some("7".to_string())]);

    // And to a different connection.
    let mut other = TestClient::connect(addr);
    other.startup();
    let messages = other.query("SELECT a FROM t");
    assert_eq!(data_values(&messages), vec![Some("7".to_string())]);
}

#[test]
fn test_s4_abort_visibility() {
    for strategy in [CcStrategy::Occ, CcStrategy::TwoPhase] {
        let addr = start_server(strategy);
        let mut setup = TestClient::connect(addr);
        setup.startup();
        setup.query("CREATE TABLE t (a int)");
        setup.query("INSERT INTO t VALUES (0)");

        let mut writer = TestClient::connect(addr);
        writer.startup();
        writer.query("BEGIN");
        writer.query("UPDATE t SET a = 100 WHERE a = 0");

        // Concurrent reader; under 2PL it blocks until the writer resolves.
        let reader = thread::spawn(move || {
            let mut client = TestClient::connect(addr);
            client.startup();
            client.query("BEGIN");
            let messages = client.query("SELECT a FROM t");
            client.query("COMMIT");
            data_values(&messages)
        });

        thread::sleep(Duration::from_millis(100));
        writer.query("ROLLBACK");

        assert_eq!(
            reader.join().unwrap(),
            vec![Some("0".to_string())],
            "aborted write must never be observed ({strategy:?})"
        );

        // After the abort everyone still sees 0.
        let messages = setup.query("SELECT a FROM t");
        assert_eq!(data_values(&messages), vec![Some("0".to_string())]);
    }
}

#[test]
fn test_s5_parse_bind_execute() {
    let addr = start_server(CcStrategy::Occ);
    let mut client = TestClient::connect(addr);
    client.startup();

    client.parse("s1", "SELECT $1::int", &[23]);
    client.bind("p1", "s1", &[(0, Some(b"42"))]);
    client.execute("p1");
    let messages = client.sync();

    assert_eq!(messages[0].0, b'1');
    assert_eq!(messages[1].0, b'2');
    assert_eq!(data_values(&messages), vec![Some("42".to_string())]);
    assert_eq!(command_tags(&messages), vec!["SELECT 1"]);
    assert_eq!(ready_status(&messages), b'I');
}

#[test]
fn test_s6_duplicate_begin_filtered() {
    let addr = start_server(CcStrategy::Occ);
    let mut client = TestClient::connect(addr);
    client.startup();

    let messages = client.query("BEGIN");
    assert_eq!(command_tags(&messages), vec!["BEGIN"]);
    assert_eq!(ready_status(&messages), b'T');

    let messages = client.query("BEGIN");
    assert_eq!(command_tags(&messages), vec!["BEGIN"]);
    assert_eq!(ready_status(&messages), b'T');
}

#[test]
fn test_empty_query() {
    let addr = start_server(CcStrategy::Occ);
    let mut client = TestClient::connect(addr);
    client.startup();

    let messages = client.query("");
    assert_eq!(messages[0].0, b'I');
    assert_eq!(messages[1].0, b'Z');
    assert_eq!(messages.len(), 2);

    let messages = client.query(";");
    assert_eq!(messages[0].0, b'I');
}

#[test]
fn test_bind_count_mismatch_error_message() {
    let addr = start_server(CcStrategy::Occ);
    let mut client = TestClient::connect(addr);
    client.startup();

    client.parse("", "SELECT $1::int", &[23]);
    // One format code, zero parameter values.
    let mut body = Vec::new();
    body.push(0); // unnamed portal
    body.push(0); // unnamed statement
    body.extend_from_slice(&1i16.to_be_bytes());
    body.extend_from_slice(&0i16.to_be_bytes());
    body.extend_from_slice(&0i16.to_be_bytes());
    client.send(b'B', &body);
    let messages = client.sync();

    let error = messages.iter().find(|(t, _)| *t == b'E').unwrap();
    assert_eq!(error.1[0], b'M');
    assert_eq!(
        cstring_at(&error.1[1..]),
        "Malformed request: num_params_format is not equal to num_params"
    );
}

#[test]
fn test_extended_matches_simple() {
    let addr = start_server(CcStrategy::Occ);
    let mut client = TestClient::connect(addr);
    client.startup();

    client.query("CREATE TABLE t (a int)");
    client.query("INSERT INTO t VALUES (1), (2), (3)");

    let simple = client.query("SELECT a FROM t WHERE a = 2");

    client.parse("s2", "SELECT a FROM t WHERE a = $1", &[23]);
    client.bind("p2", "s2", &[(0, Some(b"2"))]);
    client.describe_portal("p2");
    client.execute("p2");
    let extended = client.sync();

    assert_eq!(data_values(&simple), data_values(&extended));
    // Describe replied with the same row descriptor the simple path sent.
    let simple_desc = simple.iter().find(|(t, _)| *t == b'T').unwrap();
    let extended_desc = extended.iter().find(|(t, _)| *t == b'T').unwrap();
    assert_eq!(simple_desc.1, extended_desc.1);
}

#[test]
fn test_set_and_show_are_noops() {
    let addr = start_server(CcStrategy::Occ);
    let mut client = TestClient::connect(addr);
    client.startup();

    client.query("CREATE TABLE t (a int)");
    client.query("INSERT INTO t VALUES (1)");

    for _ in 0..3 {
        let messages = client.query("SET client_min_messages TO warning");
        assert_eq!(command_tags(&messages), vec!["SET 0"]);
        assert_eq!(ready_status(&messages), b'I');
    }
    let messages = client.query("SHOW server_version");
    assert_eq!(command_tags(&messages), vec!["SHOW 0"]);
    assert_eq!(ready_status(&messages), b'I');

    // No data changed.
    let messages = client.query("SELECT a FROM t");
    assert_eq!(data_values(&messages), vec![Some("1".to_string())]);
}

#[test]
fn test_explicit_transaction_commit_and_rollback() {
    let addr = start_server(CcStrategy::Occ);
    let mut client = TestClient::connect(addr);
    client.startup();

    client.query("CREATE TABLE t (a int)");

    client.query("BEGIN");
    client.query("INSERT INTO t VALUES (1)");
    let messages = client.query("COMMIT");
    assert_eq!(command_tags(&messages), vec!["COMMIT"]);
    assert_eq!(ready_status(&messages), b'I');

    client.query("BEGIN");
    client.query("INSERT INTO t VALUES (2)");
    client.query("ROLLBACK");

    let messages = client.query("SELECT a FROM t");
    assert_eq!(data_values(&messages), vec![Some("1".to_string())]);
}

#[test]
fn test_failed_block_rejects_until_rollback() {
    let addr = start_server(CcStrategy::Occ);
    let mut client = TestClient::connect(addr);
    client.startup();

    client.query("CREATE TABLE t (a int)");
    client.query("INSERT INTO t VALUES (1)");
    client.query("BEGIN");

    let messages = client.query("SELECT a / 0 FROM t");
    assert!(messages.iter().any(|(t, _)| *t == b'E'));
    assert_eq!(ready_status(&messages), b'E');

    let messages = client.query("SELECT a FROM t");
    assert!(messages.iter().any(|(t, _)| *t == b'E'));
    assert_eq!(ready_status(&messages), b'E');

    let messages = client.query("ROLLBACK");
    assert_eq!(command_tags(&messages), vec!["ROLLBACK"]);
    assert_eq!(ready_status(&messages), b'I');
}

#[test]
fn test_multi_statement_batch() {
    let addr = start_server(CcStrategy::Occ);
    let mut client = TestClient::connect(addr);
    client.startup();

    client.query("CREATE TABLE t (a int)");
    let messages = client.query("INSERT INTO t VALUES (1); INSERT INTO t VALUES (2); SELECT a FROM t");
    assert_eq!(
        command_tags(&messages),
        vec!["INSERT 0 1", "INSERT 0 1", "SELECT 2"]
    );
    let mut values = data_values(&messages);
    values.sort();
    assert_eq!(values, vec![Some("1".to_string()), Some("2".to_string())]);
}

#[test]
fn test_null_parameter_roundtrip() {
    let addr = start_server(CcStrategy::Occ);
    let mut client = TestClient::connect(addr);
    client.startup();

    client.parse("", "SELECT $1::int", &[23]);
    client.bind("", "", &[(0, None)]);
    client.execute("");
    let messages = client.sync();
    assert_eq!(data_values(&messages), vec![None]);
}

#[test]
fn test_binary_parameter() {
    let addr = start_server(CcStrategy::Occ);
    let mut client = TestClient::connect(addr);
    client.startup();

    client.parse("", "SELECT $1::int", &[23]);
    client.bind("", "", &[(1, Some(&7i32.to_be_bytes()))]);
    client.execute("");
    let messages = client.sync();
    assert_eq!(data_values(&messages), vec![Some("7".to_string())]);
}

#[test]
fn test_write_write_conflict_reported_under_occ() {
    let addr = start_server(CcStrategy::Occ);
    let mut setup = TestClient::connect(addr);
    setup.startup();
    setup.query("CREATE TABLE t (a int)");
    setup.query("INSERT INTO t VALUES (0)");

    let mut first = TestClient::connect(addr);
    first.startup();
    let mut second = TestClient::connect(addr);
    second.startup();

    first.query("BEGIN");
    first.query("UPDATE t SET a = 1 WHERE a = 0");

    second.query("BEGIN");
    let messages = second.query("UPDATE t SET a = 2 WHERE a = 0");
    assert!(
        messages.iter().any(|(t, _)| *t == b'E'),
        "second writer must abort"
    );
    assert_eq!(ready_status(&messages), b'E');

    first.query("COMMIT");
    second.query("ROLLBACK");

    let messages = setup.query("SELECT a FROM t");
    assert_eq!(data_values(&messages), vec![Some("1".to_string())]);
}
