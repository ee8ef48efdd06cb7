use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, reload, util::SubscriberInitExt, EnvFilter};

mod config;
mod error;
mod filter;
mod mgr;
mod model;
mod proxy;
mod store;

use config::Config;
use mgr::MgrServer;
use model::{Analysis, RouteTable};
use proxy::Proxy;
use store::ProxyInfo;

#[derive(Parser, Debug)]
#[command(name = "gateway")]
#[command(about = "HTTP reverse proxy / API gateway")]
struct Args {
    /// Path to the JSON configuration file
    #[arg(long = "cfg", default_value = "cfg.json")]
    cfg: String,

    /// Initial log level (changeable through the management API)
    #[arg(long = "log-level", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if !mgr::valid_log_level(&args.log_level) {
        anyhow::bail!("bad --log-level: {}", args.log_level);
    }

    let (filter_layer, log_handle) = reload::Layer::new(EnvFilter::new(&args.log_level));
    tracing_subscriber::registry()
        .with(filter_layer)
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("bootstrap: gateway starting");

    let config = Config::load(&args.cfg).await?;

    let store = store::from_registry(&config.registry_addr, &config.prefix)
        .context("bootstrap: registry store")?;
    store
        .registry(&ProxyInfo {
            addr: config.addr.clone(),
            mgr_addr: config.mgr_addr.clone(),
        })
        .context("bootstrap: proxy registration")?;

    let analysis = Arc::new(Analysis::new());
    analysis.start_ticker();

    let route_table = RouteTable::new(store, Arc::clone(&analysis));
    route_table
        .load()
        .await
        .context("bootstrap: route table load")?;

    let prometheus = PrometheusBuilder::new()
        .install_recorder()
        .context("bootstrap: prometheus recorder")?;

    // bind the management address here so a bad mgrAddr is fatal at boot
    let mgr_listener = TcpListener::bind(&config.mgr_listen_addr())
        .await
        .with_context(|| format!("bootstrap: bind mgr address {}", config.mgr_addr))?;
    let mgr = MgrServer::new(Arc::clone(&analysis), log_handle, prometheus);
    tokio::spawn(async move {
        if let Err(e) = mgr.serve_on(mgr_listener).await {
            error!("mgr server error: {}", e);
        }
    });

    let proxy = Proxy::new(config, Arc::clone(&route_table))?;

    let ingress = tokio::spawn(Arc::clone(&proxy).serve());

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("stop: received shutdown signal");
        }
        joined = ingress => {
            joined.context("ingress task")??;
            anyhow::bail!("ingress server exited unexpectedly");
        }
    }

    proxy.stop();
    route_table.stop_watch();

    info!("stop: gateway proxy stopped");
    Ok(())
}
