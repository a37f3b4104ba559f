//! Line echo over TCP.
//!
//! ```text
//! cargo run --bin tcp_echo -- server 7878
//! cargo run --bin tcp_echo -- client 127.0.0.1 7878 "first; second"
//! ```

mod echo;

use tether_core::Protocol;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    echo::run(Protocol::Tcp).await
}
