use std::io::{BufReader, Write};
use std::net::{SocketAddr, TcpStream};
use std::os::fd::AsRawFd;
use std::thread;
use std::time::Duration;

use scriptport::runtime::Limits;
use scriptport::service::{CycleReport, Server, ServerConfig};
use serde_json::de::{IoRead, StreamDeserializer};
use serde_json::{Value as Json, json};

/// Raw socket speaking the line protocol, decoding replies as a JSON stream.
struct RawConnection {
    stream: TcpStream,
    replies: StreamDeserializer<'static, IoRead<BufReader<TcpStream>>, Json>,
}

impl RawConnection {
    fn open(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).expect("connect");
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .expect("read timeout");
        let reader = BufReader::new(stream.try_clone().expect("clone"));
        let replies = serde_json::Deserializer::from_reader(reader).into_iter::<Json>();
        Self { stream, replies }
    }

    fn send(&mut self, line: &str) {
        self.stream.write_all(line.as_bytes()).expect("write");
        self.stream.flush().expect("flush");
    }

    fn reply(&mut self) -> Json {
        self.replies.next().expect("reply").expect("json reply")
    }
}

fn test_server(limits: Limits) -> Server {
    let config = ServerConfig::default()
        .with_port(0)
        .with_limits(limits)
        .with_idle_interval(Duration::from_millis(5));
    Server::bind(config).expect("bind")
}

/// Run cycles until `done` holds for a report, panicking if it never does.
fn cycle_until(server: &mut Server, done: impl Fn(&CycleReport) -> bool) -> CycleReport {
    for _ in 0..400 {
        let report = server.run_cycle().expect("cycle");
        if done(&report) {
            return report;
        }
        thread::sleep(Duration::from_millis(5));
    }
    panic!("server never reached the expected state");
}

fn accept(server: &mut Server) -> RawConnection {
    let connection = RawConnection::open(server.local_addr().expect("addr"));
    cycle_until(server, |report| report.accepted.is_some());
    connection
}

fn round_trip(server: &mut Server, connection: &mut RawConnection, line: &str) -> Json {
    connection.send(line);
    cycle_until(server, |report| report.served > 0);
    connection.reply()
}

#[test]
fn add_request_scenario() {
    let mut server = test_server(Limits::default());
    let mut connection = accept(&mut server);
    let reply = round_trip(&mut server, &mut connection, "5:42:return 1+1\n");
    assert_eq!(
        reply,
        json!({"timeout": false, "result": 2, "error": null, "reply_id": 42})
    );
}

#[test]
fn infinite_loop_scenario_times_out() {
    let mut server = test_server(Limits::default());
    let mut connection = accept(&mut server);
    let reply = round_trip(&mut server, &mut connection, "0:7:while true do end\n");
    assert_eq!(reply["timeout"], true);
    assert_eq!(reply["result"], Json::Null);
    assert_eq!(reply["reply_id"], 7);
}

#[test]
fn compile_error_leaves_connection_usable() {
    let mut server = test_server(Limits::default());
    let mut connection = accept(&mut server);

    let reply = round_trip(&mut server, &mut connection, "0:1:return )\n");
    assert_eq!(reply["timeout"], false);
    assert_eq!(reply["result"], Json::Null);
    assert!(reply["error"].is_string());
    assert_eq!(reply["reply_id"], 1);

    let reply = round_trip(&mut server, &mut connection, "10:2:return 5\n");
    assert_eq!(reply["result"], 5);
    assert_eq!(reply["reply_id"], 2);
    assert_eq!(server.connection_count(), 1);
}

#[test]
fn malformed_lines_get_protocol_errors() {
    let mut server = test_server(Limits::default());
    let mut connection = accept(&mut server);

    let reply = round_trip(&mut server, &mut connection, "hello there\n");
    assert_eq!(reply["reply_id"], Json::Null);
    assert_eq!(reply["timeout"], false);
    assert!(
        reply["error"]
            .as_str()
            .is_some_and(|e| e.starts_with("protocol error:"))
    );

    let reply = round_trip(&mut server, &mut connection, "abc:9:return 1\n");
    assert_eq!(reply["reply_id"], 9);
    assert!(reply["error"].as_str().is_some_and(|e| e.contains("length")));

    let reply = round_trip(&mut server, &mut connection, "3:10:return 'ok'\r\n");
    assert_eq!(reply["result"], "ok");
}

#[test]
fn results_render_through_the_wire() {
    let mut server = test_server(Limits::default());
    let mut connection = accept(&mut server);

    let reply = round_trip(
        &mut server,
        &mut connection,
        "0:1:local t = {} t.me = t return t\n",
    );
    assert_eq!(reply["result"], json!({"me": "<recursion>"}));

    let reply = round_trip(&mut server, &mut connection, "0:2:return {{{{{{}}}}}}\n");
    assert_eq!(reply["result"], json!([[[["<too deep>"]]]]));

    let reply = round_trip(&mut server, &mut connection, "0:3:return {[1]=1,[2]=2,[3]=3,[5]=5}\n");
    assert!(reply["result"].is_object());

    let reply = round_trip(&mut server, &mut connection, "0:4:return {'a', 'b:c'}\n");
    assert_eq!(reply["result"], json!(["a", "b:c"]));
}

#[test]
fn new_connection_is_not_read_in_its_accept_cycle() {
    let mut server = test_server(Limits::default());
    let mut connection = RawConnection::open(server.local_addr().expect("addr"));
    connection.send("0:5:return 5\n");
    thread::sleep(Duration::from_millis(20));

    let first = cycle_until(&mut server, |report| report.accepted.is_some());
    assert_eq!(first.served, 0);

    cycle_until(&mut server, |report| report.served > 0);
    assert_eq!(connection.reply()["result"], 5);
}

#[test]
fn clients_are_served_independently() {
    let mut server = test_server(Limits::default().with_compute_budget(200));
    let mut slow = accept(&mut server);
    let mut fast = accept(&mut server);
    assert_eq!(server.connection_count(), 2);

    slow.send("0:1:while true do end\n");
    fast.send("0:2:return 'quick'\n");
    let mut served = 0;
    while served < 2 {
        served += cycle_until(&mut server, |report| report.served > 0).served;
    }

    assert_eq!(slow.reply()["timeout"], true);
    let reply = fast.reply();
    assert_eq!(reply["result"], "quick");
    assert_eq!(reply["reply_id"], 2);
}

#[test]
fn hangup_removes_connection_once() {
    let mut server = test_server(Limits::default());
    let connection = accept(&mut server);
    let mut survivor = accept(&mut server);
    assert_eq!(server.connection_count(), 2);

    drop(connection);
    for _ in 0..400 {
        server.run_cycle().expect("cycle");
        if server.connection_count() == 1 {
            break;
        }
        thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(server.connection_count(), 1);

    for _ in 0..5 {
        let report = server.run_cycle().expect("cycle");
        assert_eq!(report.retired, 0);
        assert_eq!(server.connection_count(), 1);
    }

    let reply = round_trip(&mut server, &mut survivor, "0:3:return 3\n");
    assert_eq!(reply["result"], 3);
}

/// Make dropping `stream` reset the connection instead of closing it.
fn reset_on_close(stream: &TcpStream) {
    let linger = libc::linger {
        l_onoff: 1,
        l_linger: 0,
    };
    // SAFETY: `linger` outlives the call and its size is passed alongside.
    let rc = unsafe {
        libc::setsockopt(
            stream.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_LINGER,
            (&linger as *const libc::linger).cast(),
            std::mem::size_of::<libc::linger>() as libc::socklen_t,
        )
    };
    assert_eq!(rc, 0, "setsockopt(SO_LINGER)");
}

#[test]
fn reset_connection_is_dropped_while_polling() {
    let mut server = test_server(Limits::default());
    let connection = accept(&mut server);
    let mut survivor = accept(&mut server);
    assert_eq!(server.connection_count(), 2);

    reset_on_close(&connection.stream);
    drop(connection);
    for _ in 0..400 {
        let report = server.run_cycle().expect("cycle");
        // closed by the poll, never read or retired
        assert_eq!(report.retired, 0);
        assert_eq!(report.served, 0);
        if server.connection_count() == 1 {
            break;
        }
        thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(server.connection_count(), 1);

    for _ in 0..5 {
        assert_eq!(server.run_cycle().expect("cycle"), Default::default());
        assert_eq!(server.connection_count(), 1);
    }

    let reply = round_trip(&mut server, &mut survivor, "0:4:return 4\n");
    assert_eq!(reply["result"], 4);
}

#[test]
fn shutdown_closes_connections() {
    let mut server = test_server(Limits::default());
    let mut connection = accept(&mut server);
    server.shutdown();
    assert_eq!(server.connection_count(), 0);
    assert!(connection.replies.next().is_none());
}
