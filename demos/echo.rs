//! Echo server and client shared by the `tcp_echo` and `udp_echo` binaries.
//!
//! ```text
//! <bin> server [port]                 echo every line back to its sender
//! <bin> client [host] [port] [text]   send lines of text and print replies
//! ```

use anyhow::{bail, Context};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::info;
use tracing_subscriber::EnvFilter;

use tether_core::{FailPolicy, Protocol, SocketConfig};
use tether_network::{ClientSocket, ServerSocket};

const DEFAULT_PORT: u16 = 7878;

/// One message per line.
fn line_validator(buf: &[u8]) -> usize {
    buf.iter().position(|&b| b == b'\n').map_or(0, |pos| pos + 1)
}

pub async fn run(protocol: Protocol) -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.first().map(String::as_str) {
        Some("server") => {
            let port = parse_port(args.get(1))?;
            serve(protocol, port).await
        }
        Some("client") => {
            let host = args.get(1).map_or("127.0.0.1", String::as_str);
            let port = parse_port(args.get(2))?;
            let text = if args.len() > 3 { args[3..].join(" ") } else { "hello from tether".to_string() };
            call(protocol, host, port, &text).await
        }
        _ => bail!("usage: server [port] | client [host] [port] [text]"),
    }
}

fn parse_port(arg: Option<&String>) -> anyhow::Result<u16> {
    match arg {
        Some(port) => port.parse().with_context(|| format!("invalid port {:?}", port)),
        None => Ok(DEFAULT_PORT),
    }
}

async fn serve(protocol: Protocol, port: u16) -> anyhow::Result<()> {
    let mut server = ServerSocket::with_config(protocol, SocketConfig::default());
    server.set_packet_validator(line_validator);
    server.set_on_connect(|conn| info!("{} connected from {:?}", conn.id(), conn.peer_addr()));
    server.set_on_close(|conn| info!("{} closed", conn.id()));
    server.set_on_receive(|conn, data| {
        info!("{} sent {:?}", conn.id(), String::from_utf8_lossy(data).trim_end());
        if let Err(e) = conn.send_with_policy(data.to_vec(), FailPolicy::Resend, None) {
            info!("could not echo to {}: {}", conn.id(), e);
        }
    });

    server.listen(port).await?;
    info!("{} echo server on {:?}, ctrl-c to stop", protocol, server.local_addr());

    tokio::signal::ctrl_c().await?;
    server.close().await;
    Ok(())
}

async fn call(protocol: Protocol, host: &str, port: u16, text: &str) -> anyhow::Result<()> {
    let lines: Vec<String> = text.split(';').map(|line| format!("{}\n", line.trim())).collect();
    let expected = lines.len();

    let replies = Arc::new(AtomicUsize::new(0));
    let done = Arc::new(Notify::new());

    let mut client = ClientSocket::with_config(protocol, SocketConfig::default());
    client.set_packet_validator(line_validator);
    let (counter, finished) = (replies.clone(), done.clone());
    client.set_on_receive(move |_conn, data| {
        println!("{}", String::from_utf8_lossy(data).trim_end());
        if counter.fetch_add(1, Ordering::SeqCst) + 1 == expected {
            finished.notify_one();
        }
    });

    client.connect(host, port).await?;
    for line in lines {
        client.send_with_policy(line.into_bytes(), FailPolicy::Resend, None)?;
    }

    let waited = tokio::time::timeout(Duration::from_secs(5), done.notified()).await;
    client.close().await;
    if waited.is_err() {
        bail!(
            "received {} of {} replies before timing out",
            replies.load(Ordering::SeqCst),
            expected
        );
    }
    Ok(())
}
