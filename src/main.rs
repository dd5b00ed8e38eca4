use anyhow::{Context, Result};
use tracing::{error, info, warn};

use open_music_link::{
    config::Config,
    events::{listener, Event},
    node::rest::RestClient,
    pool::NodePool,
};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("open_music_link=debug".parse()?)
                .add_directive("tokio_tungstenite=info".parse()?)
                .add_directive("reqwest=info".parse()?),
        )
        .init();

    info!("🎵 Iniciando Open Music Link v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::load()?;
    info!("{}", config.summary());

    if std::env::args().any(|arg| arg == "--health-check") {
        return health_check(&config).await;
    }

    let pool = NodePool::from_config(&config).context("building node pool")?;
    pool.events().on_any(listener(|event| async move { log_event(&event) }));

    for node in &config.nodes {
        pool.register(node.clone())
            .with_context(|| format!("registering node {}", node.name))?;
    }
    info!("🚀 {} nodo(s) registrados, esperando Ctrl+C", config.nodes.len());

    tokio::signal::ctrl_c()
        .await
        .context("listening for Ctrl+C")?;
    info!("⚠️ Señal de apagado recibida");
    pool.shutdown();

    Ok(())
}

fn log_event(event: &Event) {
    match event {
        Event::NodeReady { node, resumed, .. } => info!(%node, resumed, "✅ Nodo listo"),
        Event::NodeStatsUpdate { .. } | Event::PlayerUpdate { .. } => {}
        Event::MigrationFailed { guild_id, node } => {
            warn!(guild_id = %guild_id, %node, "ningún nodo pudo tomar el player")
        }
        Event::TrackException { guild_id, exception, .. } => {
            warn!(guild_id = %guild_id, message = ?exception.message, "excepción en track")
        }
        other => info!(kind = ?other.kind(), guild_id = ?other.guild_id(), "evento"),
    }
}

/// Consulta el endpoint de info de cada nodo configurado.
async fn health_check(config: &Config) -> Result<()> {
    let mut healthy = true;
    for node in &config.nodes {
        let client = RestClient::new(node, &config.node_options)?;
        match client.info().await {
            Ok(info) => info!(node = %node.name, version = %info.version.semver, "nodo accesible"),
            Err(e) => {
                error!(node = %node.name, error = %e, "nodo inaccesible");
                healthy = false;
            }
        }
    }

    if healthy {
        println!("OK");
        Ok(())
    } else {
        anyhow::bail!("Algunos nodos no son accesibles");
    }
}
