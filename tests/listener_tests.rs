//! # Listener and End-to-End Tests
//!
//! Bind retry policy, SO_REUSEPORT shards, the admin socket, and full
//! accept -> admit -> worker round trips in inline and dedicated mode.

mod common;

use common::{loopback_pair, wait_until};
use gatehouse::echo::EchoExecutor;
use gatehouse::{GatehouseError, Server, ServerConfig, ServerRuntime};
use gatehouse_core::bridge::SqBridge;
use gatehouse_core::SessionCategory;
use gatehouse_transport::{
    retry_addr_in_use, DedicatedDispatcher, ListenerSet, PendingConnection, RetryPolicy, SocketKind,
};
use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::{Duration, Instant};

fn policy(timeout_ms: u64) -> RetryPolicy {
    RetryPolicy {
        timeout: Duration::from_millis(timeout_ms),
        initial: Duration::from_millis(1),
        max: Duration::from_millis(10),
    }
}

fn ephemeral() -> ServerConfig {
    ServerConfig {
        port: 0,
        shutdown_grace_period_ms: 200,
        drain_log_interval_ms: 50,
        ..ServerConfig::default()
    }
}

fn connect(addr: SocketAddr) -> (TcpStream, BufReader<TcpStream>) {
    let stream = TcpStream::connect(addr).expect("connect");
    stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    let reader = BufReader::new(stream.try_clone().unwrap());
    (stream, reader)
}

fn round_trip(stream: &mut TcpStream, reader: &mut BufReader<TcpStream>, msg: &str) -> String {
    writeln!(stream, "{}", msg).unwrap();
    let mut line = String::new();
    reader.read_line(&mut line).unwrap();
    line.trim_end().to_string()
}

/// Three "address in use" failures followed by success bind on the fourth
/// attempt.
#[test]
fn test_bind_retries_through_addr_in_use() {
    let t = Instant::now();

    let addr: SocketAddr = "127.0.0.1:3306".parse().unwrap();
    let result = retry_addr_in_use(addr, policy(1_000), |attempt| {
        if attempt <= 3 {
            Err(io::Error::from(io::ErrorKind::AddrInUse))
        } else {
            Ok(attempt)
        }
    });
    assert_eq!(result.unwrap(), 4);

    let overhead = t.elapsed();
    println!("test_bind_retries_through_addr_in_use: Testing Overhead = {:?}", overhead);
}

#[test]
fn test_bind_gives_up_after_timeout() {
    let t = Instant::now();

    let addr: SocketAddr = "127.0.0.1:3306".parse().unwrap();
    let started = Instant::now();
    let result: Result<(), _> = retry_addr_in_use(addr, policy(50), |_| Err(io::Error::from(io::ErrorKind::AddrInUse)));
    assert!(started.elapsed() >= Duration::from_millis(50));
    match result {
        Err(GatehouseError::BindTimeout { attempts, .. }) => assert!(attempts > 1),
        other => panic!("expected BindTimeout, got {:?}", other),
    }

    let overhead = t.elapsed();
    println!("test_bind_gives_up_after_timeout: Testing Overhead = {:?}", overhead);
}

/// Anything but "address in use" aborts on the first attempt.
#[test]
fn test_other_bind_errors_are_fatal() {
    let t = Instant::now();

    let addr: SocketAddr = "127.0.0.1:3306".parse().unwrap();
    let mut calls = 0;
    let result: Result<(), _> = retry_addr_in_use(addr, policy(1_000), |_| {
        calls += 1;
        Err(io::Error::from(io::ErrorKind::PermissionDenied))
    });
    assert!(matches!(result, Err(GatehouseError::Bind { .. })));
    assert_eq!(calls, 1);

    let overhead = t.elapsed();
    println!("test_other_bind_errors_are_fatal: Testing Overhead = {:?}", overhead);
}

/// Startup against a port somebody else holds fails with a timeout.
#[test]
fn test_startup_aborts_on_occupied_port() {
    let t = Instant::now();

    let squatter = TcpListener::bind("127.0.0.1:0").unwrap();
    let config = ServerConfig {
        port: squatter.local_addr().unwrap().port(),
        bind_timeout_ms: 100,
        ..ephemeral()
    };
    let result = Server::builder()
        .with_config(config)
        .with_executor(Arc::new(EchoExecutor::default()))
        .start();
    assert!(matches!(result, Err(GatehouseError::BindTimeout { .. })));

    let overhead = t.elapsed();
    println!("test_startup_aborts_on_occupied_port: Testing Overhead = {:?}", overhead);
}

#[test]
fn test_reuse_port_shards_and_admin_socket() {
    let t = Instant::now();

    let config = ServerConfig {
        num_listen_shards: 3,
        admin_port: Some(0),
        ..ephemeral()
    };
    let set = ListenerSet::bind(&config).expect("bind shards");
    let kinds: Vec<SocketKind> = set.sockets().iter().map(|s| s.kind()).collect();
    assert_eq!(
        kinds,
        vec![
            SocketKind::Primary,
            SocketKind::PrimaryShard(1),
            SocketKind::PrimaryShard(2),
            SocketKind::Admin
        ]
    );

    let primary = set.primary_addr().unwrap();
    for socket in &set.sockets()[..3] {
        assert_eq!(socket.local_addr(), primary, "Shards share the primary port");
    }
    assert_ne!(set.admin_addr().unwrap().port(), primary.port());

    set.shutdown_all();
    set.shutdown_all();
    assert!(set.sockets().iter().all(|s| s.is_closed()));

    let overhead = t.elapsed();
    println!("test_reuse_port_shards_and_admin_socket: Testing Overhead = {:?}", overhead);
}

#[test]
fn test_inline_echo_and_shutdown() {
    let t = Instant::now();

    let server = Server::builder()
        .with_config(ephemeral())
        .with_executor(Arc::new(EchoExecutor::default()))
        .start()
        .expect("start");
    let addr = server.local_addr().unwrap();

    let (mut stream, mut reader) = connect(addr);
    assert_eq!(round_trip(&mut stream, &mut reader, "hello"), "hello");
    assert_eq!(server.stats().live_connections, 1);

    assert!(server.shutdown());
    let report = server.wait();
    assert_eq!(report.forced_closed, 0, "Echo sessions honour the soft kill");

    let mut rest = String::new();
    assert_eq!(reader.read_line(&mut rest).unwrap_or(0), 0, "Session stream is closed");
    assert!(TcpStream::connect_timeout(&addr, Duration::from_millis(200)).is_err());

    let stats = server.stats();
    assert_eq!(stats.live_connections, 0);
    assert_eq!(stats.live_workers, 0);

    let overhead = t.elapsed();
    println!("test_inline_echo_and_shutdown: Testing Overhead = {:?}", overhead);
}

/// Dedicated dispatchers serve many clients over the rings.
#[test]
fn test_dedicated_dispatch_round_trip() {
    let t = Instant::now();

    let config = ServerConfig {
        enable_dedicated_dispatchers: true,
        num_dispatchers: 2,
        dispatcher_queue_capacity: 8,
        num_listen_shards: 2,
        ..ephemeral()
    };
    let server = Server::builder()
        .with_config(config)
        .with_executor(Arc::new(EchoExecutor::default()))
        .start()
        .expect("start");
    let addr = server.local_addr().unwrap();

    let mut clients: Vec<_> = (0..16).map(|_| connect(addr)).collect();
    for (n, (stream, reader)) in clients.iter_mut().enumerate() {
        let msg = format!("client-{}", n);
        assert_eq!(round_trip(stream, reader, &msg), msg);
    }
    assert!(wait_until(Duration::from_secs(5), || server.stats().live_connections == 16));

    assert!(server.shutdown());
    assert_eq!(server.stats().live_connections, 0);
    assert_eq!(server.stats().total_accepted, 16);

    let overhead = t.elapsed();
    println!("test_dedicated_dispatch_round_trip: Testing Overhead = {:?}", overhead);
}

/// A full server refuses normal clients with the classic message but still
/// serves the admin port.
#[test]
fn test_rejection_message_and_admin_bypass() {
    let t = Instant::now();

    let config = ServerConfig {
        max_connections: 1,
        admission_slack: 0,
        admin_port: Some(0),
        ..ephemeral()
    };
    let server = Server::builder()
        .with_config(config)
        .with_executor(Arc::new(EchoExecutor::default()))
        .start()
        .expect("start");
    let addr = server.local_addr().unwrap();

    let (mut first, mut first_reader) = connect(addr);
    assert_eq!(round_trip(&mut first, &mut first_reader, "ping"), "ping");

    let (_second, mut second_reader) = connect(addr);
    let mut line = String::new();
    second_reader.read_line(&mut line).unwrap();
    assert_eq!(line, "ERROR 1040 (08004): Too many connections\n");

    let (mut admin, mut admin_reader) = connect(server.admin_addr().unwrap());
    assert_eq!(round_trip(&mut admin, &mut admin_reader, "status"), "status");

    let stats = server.stats();
    assert_eq!(stats.rejected_capacity, 1);
    assert_eq!(stats.total_rejected, 1);
    assert_eq!(stats.live_connections, 2);

    assert!(server.shutdown());

    let overhead = t.elapsed();
    println!("test_rejection_message_and_admin_bypass: Testing Overhead = {:?}", overhead);
}

/// A replication dump keeps streaming until shutdown reaches it.
#[test]
fn test_replication_dump_drained_last() {
    let t = Instant::now();

    let server = Server::builder()
        .with_config(ephemeral())
        .with_executor(Arc::new(EchoExecutor::default()))
        .start()
        .expect("start");
    let addr = server.local_addr().unwrap();

    let (mut dump, mut dump_reader) = connect(addr);
    writeln!(dump, "BINLOG DUMP").unwrap();
    let mut event = String::new();
    dump_reader.read_line(&mut event).unwrap();
    assert!(event.starts_with("event "), "got {:?}", event);

    let (mut normal, mut normal_reader) = connect(addr);
    assert_eq!(round_trip(&mut normal, &mut normal_reader, "hi"), "hi");

    assert!(server.shutdown());
    let report = server.wait();
    assert_eq!(report.forced_closed, 0);
    assert_eq!(server.stats().live_connections, 0);

    let overhead = t.elapsed();
    println!("test_replication_dump_drained_last: Testing Overhead = {:?}", overhead);
}

/// Connections still queued for a dispatcher when shutdown begins are
/// refused and closed, never admitted, and the ring ends up empty.
#[test]
fn test_dispatcher_refuses_queued_connections_after_shutdown() {
    let t = Instant::now();

    let rt = ServerRuntime::new(ephemeral(), Arc::new(EchoExecutor::default()));
    let ring = SqBridge::new(4);
    let mut clients = Vec::new();
    for _ in 0..3 {
        let (server, client) = loopback_pair();
        clients.push(client);
        let pending = PendingConnection {
            stream: server,
            category: SessionCategory::Normal,
        };
        assert!(ring.try_push(pending).is_ok());
    }
    rt.begin_shutdown();

    let producers_done = Arc::new(AtomicBool::new(true));
    DedicatedDispatcher::new(0, vec![Arc::clone(&ring)], Arc::clone(&rt), producers_done).run();

    assert!(ring.is_empty());
    let stats = rt.stats_snapshot();
    assert_eq!(stats.rejected_shutdown, 3);
    assert_eq!(stats.live_connections, 0);
    assert_eq!(stats.admitted_connections, 0);
    assert_eq!(stats.threads_spawned, 0);

    for client in &mut clients {
        client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let mut buf = [0u8; 64];
        assert_eq!(client.read(&mut buf).unwrap(), 0, "Refused stream is closed without a message");
    }

    let overhead = t.elapsed();
    println!(
        "test_dispatcher_refuses_queued_connections_after_shutdown: Testing Overhead = {:?}",
        overhead
    );
}
