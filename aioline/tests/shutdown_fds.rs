//! Descriptor-leak check across a full transport lifecycle.
//!
//! Lives in its own test binary: `/proc/self/fd` counting is only stable
//! when no sibling test is opening sockets in the same process.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use aioline::{AiolineBuilder, ConfigBuilder};

fn open_fd_count() -> usize {
    std::fs::read_dir("/proc/self/fd").unwrap().count()
}

#[test]
fn graceful_shutdown_releases_all_fds() {
    let fds_before = open_fd_count();
    {
        let config = ConfigBuilder::new()
            .workers(1)
            .pin_to_core(false)
            .build()
            .unwrap();
        let transport = AiolineBuilder::new(config)
            .bind("127.0.0.1:0".parse().unwrap())
            .launch()
            .expect("launch failed");
        let addr = transport.local_addr().unwrap().to_string();

        std::thread::scope(|s| {
            s.spawn(|| {
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

            let mut stream = TcpStream::connect(&addr).unwrap();
            stream
                .set_read_timeout(Some(Duration::from_secs(5)))
                .unwrap();
            stream.write_all(b"leak check").unwrap();
            let mut buf = [0u8; 10];
            stream.read_exact(&mut buf).unwrap();
            assert_eq!(&buf, b"leak check");
            drop(stream);

            transport.close_accept();
        });
        transport.join().unwrap();
    }
    let fds_after = open_fd_count();
    assert_eq!(
        fds_before, fds_after,
        "fd count changed across transport lifecycle"
    );
}
