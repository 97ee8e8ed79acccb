//! Console-driven broadcast server
//!
//! Run with: cargo run --example console_server [BIND_ADDR] [HEARTBEAT_SECS]
//!
//! Examples:
//!   cargo run --example console_server                   # binds to 127.0.0.1:50000
//!   cargo run --example console_server :50001            # all interfaces, port 50001
//!   cargo run --example console_server 127.0.0.1:0 10    # ephemeral port, 10s heartbeat
//!
//! Every line typed on stdin is broadcast to all connected clients. Type
//! `quit` (or close stdin) to shut the server down. Bytes sent by clients on
//! 127.0.0.1 are printed.
//!
//! Try it with netcat:
//!   nc 127.0.0.1 50000

use std::time::Duration;

use tcp_hub::{ServerConfig, TcpServer};
use tokio::io::{AsyncBufReadExt, BufReader};

const DEFAULT_ADDR: &str = "127.0.0.1:50000";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = std::env::args().collect();

    if args.iter().any(|a| a == "-h" || a == "--help") {
        println!("Usage: console_server [BIND_ADDR] [HEARTBEAT_SECS]");
        return Ok(());
    }

    let bind_addr = args.get(1).map(String::as_str).unwrap_or(DEFAULT_ADDR);
    let heartbeat = match args.get(2) {
        Some(secs) => Duration::from_secs(secs.parse()?),
        None => tcp_hub::server::DEFAULT_HEARTBEAT,
    };

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("tcp_hub=debug".parse()?)
                .add_directive("console_server=debug".parse()?),
        )
        .init();

    let server = TcpServer::with_config(ServerConfig::default().heartbeat(heartbeat));
    server.register("127.0.0.1".parse()?, |msg| {
        println!(
            "Server received from 127.0.0.1:\n{}",
            String::from_utf8_lossy(&msg)
        );
    });

    let addr = server.start(bind_addr).await?;
    println!("Listening on {} (heartbeat {:?})", addr, server.heartbeat());
    println!("Type a line to broadcast it, `quit` to exit.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line? {
                Some(line) if line.trim() == "quit" => break,
                Some(line) => {
                    let count = server.client_count().await?;
                    server.broadcast(line.into_bytes()).await?;
                    println!("Broadcast to {} client(s)", count);
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                println!();
                break;
            }
        }
    }

    println!("Shutting down...");
    server.close().await?;
    Ok(())
}
