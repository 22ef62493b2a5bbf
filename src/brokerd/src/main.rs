use std::env;
use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::Context;
use tracing::info;
use tracing_subscriber::EnvFilter;

use brokerd::config::BackendKind;
use brokerd::server::register_devices;
use brokerd::{BrokerConfig, BrokerCtx, Server};
use ocnvm::{EmuBackend, NvmBackend};
use ocpool::{FileJournal, Journal, LogDirectory, Manager, NoopJournal};

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = match env::args().nth(1) {
        Some(path) => BrokerConfig::load(Path::new(&path))
            .with_context(|| format!("failed to load config {path}"))?,
        None => BrokerConfig::default(),
    };

    let ip = Server::resolve_bind_ip(&config)?;

    let backend: Arc<dyn NvmBackend> = match config.backend {
        BackendKind::Emulated => Arc::new(EmuBackend::new(config.geometry.into())),
    };
    let journal: Arc<dyn Journal> = match &config.journal_path {
        Some(path) => Arc::new(
            FileJournal::open(path)
                .with_context(|| format!("failed to open journal {}", path.display()))?,
        ),
        None => Arc::new(NoopJournal),
    };
    let manager = Arc::new(Manager::new(
        ip.to_string(),
        Arc::new(LogDirectory::new()),
        journal,
    ));

    let registered = register_devices(&manager, &*backend, &config)
        .context("failed to open a configured device")?;
    if registered == 0 {
        info!("no devices found; serving an empty pool");
    }
    manager.restore();
    manager.publish_resources();

    let ctx = Arc::new(BrokerCtx {
        manager: manager.clone(),
        backend,
        vblk_selftest: config.vblk_selftest,
    });
    let server = Server::bind(&config, ctx).context("failed to start server")?;
    let addr = server.local_addr()?;
    info!(%addr, "listening");

    let stop = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGINT, stop.clone())
        .context("failed to install SIGINT handler")?;
    signal_hook::flag::register(signal_hook::consts::SIGTERM, stop.clone())
        .context("failed to install SIGTERM handler")?;

    server.run(&stop)?;

    info!("shutting down");
    manager.persist();
    Ok(())
}
