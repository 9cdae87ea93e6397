// postwire daemon: hosts one peer on a UDP socket.

mod config;
mod transport;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use postwire_core::{handler, ListenOptions, Peer, RequestContext};
use serde_json::{json, Value};
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::transport::UdpTransport;

const VERSION: &str = env!("CARGO_PKG_VERSION");
const PING: &str = "ping";

fn main() -> anyhow::Result<()> {
    for arg in std::env::args().skip(1) {
        if arg == "--version" || arg == "-V" {
            println!("postwire-daemon {}", VERSION);
            return Ok(());
        }
    }

    let cfg = config::load();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cfg.log)),
        )
        .init();

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(cfg))
}

async fn run(cfg: Config) -> anyhow::Result<()> {
    let socket = UdpSocket::bind(("0.0.0.0", cfg.listen_port))
        .await
        .with_context(|| format!("binding udp port {}", cfg.listen_port))?;
    let udp = Arc::new(
        UdpTransport::new(socket, cfg.peer.max_message_bytes).with_peer_limit(cfg.max_peers),
    );
    let peer = Arc::new(Peer::with_config(udp.clone(), cfg.peer.clone()));
    peer.on(PING, ListenOptions::default(), handler(ping))?;
    info!(
        addr = %udp.local_addr()?,
        instance = peer.instance_id(),
        "postwire daemon listening"
    );

    let recv = tokio::spawn(udp.clone().run(peer.clone()));
    let pings = tokio::spawn(ping_loop(
        udp,
        peer,
        cfg.peers,
        Duration::from_secs(cfg.ping_interval_secs.max(1)),
    ));

    tokio::select! {
        res = shutdown_signal() => res?,
        res = recv => res?.context("receive loop")?,
    }
    pings.abort();
    info!("shutting down");
    Ok(())
}

async fn ping(ctx: RequestContext) -> Result<Value, Value> {
    info!(origin = %ctx.origin, data = ?ctx.data, "ping");
    Ok(double(ctx.data))
}

/// Numbers come back doubled; anything else is echoed.
fn double(data: Option<Value>) -> Value {
    match data {
        Some(Value::Number(n)) => match (n.as_i64(), n.as_f64()) {
            (Some(i), _) => json!(i.saturating_mul(2)),
            (None, Some(f)) => json!(f * 2.0),
            (None, None) => Value::Number(n),
        },
        other => other.unwrap_or(Value::Null),
    }
}

async fn ping_loop(
    udp: Arc<UdpTransport>,
    peer: Arc<Peer>,
    targets: Vec<SocketAddr>,
    every: Duration,
) {
    if targets.is_empty() {
        return;
    }
    let mut ticker = tokio::time::interval(every);
    let mut seq: i64 = 0;
    loop {
        ticker.tick().await;
        seq += 1;
        debug!(known = udp.known_peers(), seq, "ping round");
        for addr in &targets {
            let addr = *addr;
            let target = udp.handle_for(addr);
            let peer = peer.clone();
            tokio::spawn(async move {
                let domain = transport::origin(addr);
                match peer.send(&target, domain.as_str(), PING, Some(json!(seq))).await {
                    Ok(res) => info!(%addr, seq, data = %res.data, "ping answered"),
                    Err(err) => warn!(%addr, seq, error = %err, "ping failed"),
                }
            });
        }
    }
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
