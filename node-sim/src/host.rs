use std::{net::SocketAddr, time::Duration};

use anyhow::Context;
use tokio::net::TcpListener;
use tracing::info;

use node_sim::{router, SimConfig, SimState};

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let port = std::env::var("NODE_SIM_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(5000);
    let latency = std::env::var("NODE_SIM_LATENCY_MS")
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or_default();

    let state = SimState::new(SimConfig { latency });
    spawn_heartbeat_loop(state.clone());

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind node simulator at {addr}"))?;

    info!(?latency, "node simulator listening on http://{addr}");
    axum::serve(listener, router(state)).await?;
    Ok(())
}

fn spawn_heartbeat_loop(state: SimState) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        loop {
            interval.tick().await;
            state.heartbeat().await;
        }
    });
}
