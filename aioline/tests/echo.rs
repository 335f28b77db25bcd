//! Integration tests: echo traffic through real TCP connections.
//!
//! Each test launches a transport bound to 127.0.0.1:0, connects with std
//! TCP streams, drives traffic, and shuts the loops down explicitly.

use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use aioline::{AiolineBuilder, Config, ConfigBuilder, Connection, SchedulingMode, Transport};

fn test_config() -> Config {
    ConfigBuilder::new()
        .workers(1)
        .pin_to_core(false)
        .build()
        .expect("valid test config")
}

fn launch(config: Config) -> Transport {
    AiolineBuilder::new(config)
        .bind("127.0.0.1:0".parse().unwrap())
        .launch()
        .expect("launch failed")
}

/// Serve connections with a per-connection echo thread until the accept
/// queue completes.
fn serve_echo(transport: &Transport) {
    std::thread::scope(|s| {
        while let Some(conn) = transport.accept() {
            s.spawn(move || {
                while let Some(chunk) = conn.recv() {
                    if conn.send(&chunk).is_err() {
                        break;
                    }
                }
            });
        }
    });
}

fn echo_round_trip(addr: &str, msg: &[u8]) -> Vec<u8> {
    let mut stream = TcpStream::connect(addr).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    stream.write_all(msg).unwrap();
    stream.flush().unwrap();

    let mut buf = vec![0u8; msg.len()];
    let mut total = 0;
    while total < msg.len() {
        match stream.read(&mut buf[total..]) {
            Ok(0) => break,
            Ok(n) => total += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => panic!("read error: {e}"),
        }
    }
    buf.truncate(total);
    buf
}

// ── Basic echo ──────────────────────────────────────────────────────

#[test]
fn connect_and_echo() {
    let transport = launch(test_config());
    let addr = transport.local_addr().unwrap().to_string();

    std::thread::scope(|s| {
        s.spawn(|| serve_echo(&transport));

        let response = echo_round_trip(&addr, b"ping");
        assert_eq!(response, b"ping");

        transport.close_accept();
    });
    transport.join().unwrap();
}

#[test]
fn echo_large_message() {
    let transport = launch(test_config());
    let addr = transport.local_addr().unwrap().to_string();

    std::thread::scope(|s| {
        s.spawn(|| serve_echo(&transport));

        // Larger than one staging block, so the read spans iovecs.
        let msg: Vec<u8> = (0..16384).map(|i| (i % 251) as u8).collect();
        let response = echo_round_trip(&addr, &msg);
        assert_eq!(response, msg);

        transport.close_accept();
    });
    transport.join().unwrap();
}

#[test]
fn echo_multiple_connections() {
    let transport = launch(test_config());
    let addr = transport.local_addr().unwrap().to_string();

    std::thread::scope(|s| {
        s.spawn(|| serve_echo(&transport));

        let mut clients = Vec::new();
        for i in 0..4 {
            let addr = addr.clone();
            clients.push(s.spawn(move || {
                let msg = format!("connection {i}");
                let response = echo_round_trip(&addr, msg.as_bytes());
                assert_eq!(response, msg.as_bytes());
            }));
        }
        for c in clients {
            c.join().unwrap();
        }

        transport.close_accept();
    });
    transport.join().unwrap();
}

#[test]
fn echo_sequential_sends() {
    let transport = launch(test_config());
    let addr = transport.local_addr().unwrap().to_string();

    std::thread::scope(|s| {
        s.spawn(|| serve_echo(&transport));

        let mut stream = TcpStream::connect(&addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        for i in 0..10 {
            let msg = format!("msg-{i}\n");
            stream.write_all(msg.as_bytes()).unwrap();

            let mut buf = vec![0u8; msg.len()];
            let mut total = 0;
            while total < msg.len() {
                match stream.read(&mut buf[total..]) {
                    Ok(0) => break,
                    Ok(n) => total += n,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => panic!("read error: {e}"),
                }
            }
            assert_eq!(&buf[..total], msg.as_bytes(), "mismatch on send {i}");
        }
        drop(stream);

        transport.close_accept();
    });
    transport.join().unwrap();
}

// ── SO_REUSEPORT balancing ──────────────────────────────────────────

#[test]
fn reuseport_accept_balancing() {
    let config = ConfigBuilder::new()
        .workers(2)
        .pin_to_core(false)
        .build()
        .unwrap();
    let transport = launch(config);
    let addr = transport.local_addr().unwrap().to_string();

    // Keep every client open so nothing is torn down mid-count.
    let mut clients = Vec::new();
    for _ in 0..100 {
        clients.push(TcpStream::connect(&addr).unwrap());
    }

    let mut per_worker = [0usize; 2];
    for _ in 0..100 {
        let conn = transport
            .accept_timeout(Duration::from_secs(5))
            .expect("expected 100 accepted connections");
        per_worker[conn.worker_id()] += 1;
    }

    assert_eq!(per_worker[0] + per_worker[1], 100);
    assert!(
        per_worker[0] > 0 && per_worker[1] > 0,
        "kernel balanced nothing: {per_worker:?}"
    );

    drop(clients);
    transport.shutdown();
    transport.join().unwrap();
}

// ── Deferred send coalescing ────────────────────────────────────────

#[test]
fn scheduled_sends_coalesce() {
    let transport = launch(test_config());
    let addr = transport.local_addr().unwrap().to_string();

    let mut stream = TcpStream::connect(&addr).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();

    let conn = transport
        .accept_timeout(Duration::from_secs(5))
        .expect("client not accepted");

    // A storm of cross-thread sends against a mostly-parked loop; every
    // byte must come out, in order.
    std::thread::scope(|s| {
        s.spawn(|| {
            for _ in 0..1000 {
                conn.send(b"0123456789").unwrap();
            }
        });

        let mut received = Vec::with_capacity(10_000);
        let mut buf = [0u8; 4096];
        while received.len() < 10_000 {
            match stream.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => received.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => panic!("read error: {e}"),
            }
        }
        assert_eq!(received.len(), 10_000);
        for window in received.chunks(10) {
            assert_eq!(window, b"0123456789");
        }
    });

    drop(stream);
    drop(conn);
    transport.close_accept();
    transport.join().unwrap();
}

// ── Inline scheduling ───────────────────────────────────────────────

#[test]
fn inline_handler_echoes_on_loop_thread() {
    static CALLS: AtomicUsize = AtomicUsize::new(0);

    let config = ConfigBuilder::new()
        .workers(1)
        .pin_to_core(false)
        .scheduling(SchedulingMode::Inline)
        .build()
        .unwrap();
    let transport = AiolineBuilder::new(config)
        .bind("127.0.0.1:0".parse().unwrap())
        .on_data(|conn: &Connection, chunk: Vec<u8>| {
            CALLS.fetch_add(1, Ordering::SeqCst);
            let _ = conn.send(&chunk);
        })
        .launch()
        .expect("launch failed");
    let addr = transport.local_addr().unwrap().to_string();

    let response = echo_round_trip(&addr, b"inline path");
    assert_eq!(response, b"inline path");
    assert!(CALLS.load(Ordering::SeqCst) >= 1);

    transport.close_accept();
    transport.join().unwrap();
}

// ── AIO batching ────────────────────────────────────────────────────

#[test]
fn aio_receive_and_send_echo() {
    let config = ConfigBuilder::new()
        .workers(1)
        .pin_to_core(false)
        .aio_receive(true)
        .aio_send(true)
        .build()
        .unwrap();
    let transport = launch(config);
    let addr = transport.local_addr().unwrap().to_string();

    std::thread::scope(|s| {
        s.spawn(|| serve_echo(&transport));

        for i in 0..5 {
            let msg = format!("aio round {i}");
            let response = echo_round_trip(&addr, msg.as_bytes());
            assert_eq!(response, msg.as_bytes());
        }

        // Several concurrent readable sockets in one iteration.
        let mut clients = Vec::new();
        for i in 0..8 {
            let addr = addr.clone();
            clients.push(s.spawn(move || {
                let msg = format!("aio batch connection {i}");
                let response = echo_round_trip(&addr, msg.as_bytes());
                assert_eq!(response, msg.as_bytes());
            }));
        }
        for c in clients {
            c.join().unwrap();
        }

        transport.close_accept();
    });
    transport.join().unwrap();
}

// ── Zero-copy demotion ──────────────────────────────────────────────

#[test]
fn zero_copy_demotes_on_loopback_copy() {
    let config = ConfigBuilder::new()
        .workers(1)
        .pin_to_core(false)
        .zero_copy(16)
        .build()
        .unwrap();
    let transport = launch(config);
    let addr = transport.local_addr().unwrap().to_string();

    let mut stream = TcpStream::connect(&addr).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    let conn = transport
        .accept_timeout(Duration::from_secs(5))
        .expect("client not accepted");
    assert!(conn.zero_copy_enabled());

    // Above the threshold, so this goes out MSG_ZEROCOPY. Loopback always
    // falls back to copying, which must permanently demote the socket.
    let msg = b"zero copy payload (over threshold)";
    conn.send(msg).unwrap();

    let mut buf = vec![0u8; msg.len()];
    stream.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, msg);

    let deadline = Instant::now() + Duration::from_secs(5);
    while conn.zero_copy_enabled() {
        assert!(
            Instant::now() < deadline,
            "copied completion never demoted the socket"
        );
        std::thread::sleep(Duration::from_millis(10));
    }

    // Follow-up sends take the plain writev path.
    conn.send(b"post-demotion data, still flowing").unwrap();
    let mut buf = vec![0u8; 33];
    stream.read_exact(&mut buf).unwrap();

    drop(stream);
    drop(conn);
    transport.close_accept();
    transport.join().unwrap();
}

// ── Acceptor-thread (pass-fd) mode ──────────────────────────────────

#[test]
fn acceptor_thread_mode_echoes() {
    let config = ConfigBuilder::new()
        .workers(2)
        .pin_to_core(false)
        .acceptor_thread(true)
        .build()
        .unwrap();
    let transport = launch(config);
    let addr = transport.local_addr().unwrap().to_string();

    std::thread::scope(|s| {
        s.spawn(|| serve_echo(&transport));

        for i in 0..6 {
            let msg = format!("passed fd {i}");
            let response = echo_round_trip(&addr, msg.as_bytes());
            assert_eq!(response, msg.as_bytes());
        }

        transport.close_accept();
    });
    transport.join().unwrap();
}

// ── Shutdown behavior ───────────────────────────────────────────────

#[test]
fn accept_queue_completes_after_close_accept() {
    let transport = launch(test_config());

    transport.close_accept();
    // The reader observes end-of-stream, not a hang.
    assert!(transport.accept_timeout(Duration::from_secs(5)).is_none());
    transport.join().unwrap();
}

#[test]
fn forceful_shutdown_with_live_clients() {
    let transport = launch(test_config());
    let addr = transport.local_addr().unwrap().to_string();

    let _client = TcpStream::connect(&addr).unwrap();
    let conn = transport
        .accept_timeout(Duration::from_secs(5))
        .expect("client not accepted");

    transport.shutdown();
    transport.join().unwrap();

    // The aborted connection reports end-of-stream and rejects writes.
    assert!(conn.recv().is_none());
    assert!(conn.send(b"too late").is_err());
}

#[test]
fn connection_close_from_application() {
    let transport = launch(test_config());
    let addr = transport.local_addr().unwrap().to_string();

    let mut stream = TcpStream::connect(&addr).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    let conn = transport
        .accept_timeout(Duration::from_secs(5))
        .expect("client not accepted");

    conn.close();

    // The loop tears the socket down; the peer observes end-of-stream.
    let mut buf = [0u8; 1];
    match stream.read(&mut buf) {
        Ok(0) => {}
        Ok(n) => panic!("expected EOF, read {n} bytes"),
        Err(e) if e.kind() == io::ErrorKind::ConnectionReset => {}
        Err(e) => panic!("unexpected error: {e}"),
    }

    transport.close_accept();
    transport.join().unwrap();
}

#[test]
fn bind_conflict_maps_to_address_in_use() {
    // A plain std listener without SO_REUSEPORT occupies the port.
    let occupant = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = occupant.local_addr().unwrap();

    let result = AiolineBuilder::new(test_config()).bind(addr).launch();
    match result {
        Err(aioline::Error::AddressInUse(reported)) => assert_eq!(reported, addr),
        Err(other) => panic!("expected AddressInUse, got {other}"),
        Ok(_) => panic!("bind unexpectedly succeeded"),
    }
}

#[test]
fn stop_sockets_is_idempotent() {
    let transport = launch(test_config());
    let addr = transport.local_addr().unwrap().to_string();

    let _client = TcpStream::connect(&addr).unwrap();
    let _conn = transport.accept_timeout(Duration::from_secs(5)).unwrap();

    let handle = transport.shutdown_handle();
    handle.stop_sockets();
    handle.stop_sockets();
    handle.close_accept();
    handle.stop();
    transport.join().unwrap();
}
