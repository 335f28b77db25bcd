//! Minimal echo server: one thread per accepted connection.
//!
//! Run with: cargo run --example echo_server
//! Then: printf 'hello' | nc 127.0.0.1 7878

use aioline::{AiolineBuilder, ConfigBuilder};

fn main() -> Result<(), aioline::Error> {
    let config = ConfigBuilder::new()
        .workers(2)
        .pin_to_core(false)
        .build()?;

    let transport = AiolineBuilder::new(config)
        .bind("127.0.0.1:7878".parse().unwrap())
        .launch()?;

    println!("listening on {}", transport.local_addr().unwrap());

    while let Some(conn) = transport.accept() {
        std::thread::spawn(move || {
            println!(
                "worker {} accepted {:?}",
                conn.worker_id(),
                conn.peer_addr()
            );
            while let Some(chunk) = conn.recv() {
                if conn.send(&chunk).is_err() {
                    break;
                }
            }
        });
    }

    transport.join().unwrap();
    Ok(())
}
