//! Fleet master serving slaves over WebSocket.
//!
//! Run with: cargo run -p master-server
//!
//! Module packages are read from `FLEET_MODULE_DIR` laid out as
//! `<module_id>/<major>.<minor>.<build>.<revision>.zpg`.

use std::{net::SocketAddr, path::Path, sync::Arc};

use anyhow::Context;
use fleet_core::{MasterConfig, ModuleCatalog, ModuleVersion};
use fleet_session::{
    Master,
    storage::{FsBlobStore, MemoryCatalog, MemoryDirectory},
};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = MasterConfig::from_env().context("invalid configuration")?;

    let blobs = FsBlobStore::new(&config.module_dir);
    blobs
        .ensure_root()
        .await
        .with_context(|| format!("cannot create {}", config.module_dir.display()))?;

    let catalog = Arc::new(MemoryCatalog::new());
    let registered = load_catalog(&config.module_dir, &catalog).await?;
    tracing::info!(registered, dir = %config.module_dir.display(), "Module catalog loaded");

    let master = Arc::new(Master::new(
        &config,
        Arc::new(MemoryDirectory::new()),
        Arc::clone(&catalog) as Arc<dyn ModuleCatalog>,
        Arc::new(blobs),
    ));

    let shutdown = CancellationToken::new();
    let monitor = master.liveness_monitor().spawn(shutdown.clone());

    let app =
        fleet_transport::create_ws_router(Arc::clone(&master)).layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("cannot bind {}", config.bind_addr))?;
    tracing::info!(
        timeout_ms = config.inactivity_timeout.as_millis(),
        "Master listening on ws://{}/ws",
        config.bind_addr
    );

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await?;

    shutdown.cancel();
    monitor.await?;
    tracing::info!("Master stopped");
    Ok(())
}

/// Register every package found under `root` as a module version.
async fn load_catalog(root: &Path, catalog: &MemoryCatalog) -> anyhow::Result<usize> {
    let mut registered = 0;
    let mut modules = tokio::fs::read_dir(root).await?;
    while let Some(module_dir) = modules.next_entry().await? {
        let Some(module_id) = module_dir
            .file_name()
            .to_str()
            .and_then(|name| name.parse::<u32>().ok())
        else {
            continue;
        };
        if !module_dir.file_type().await?.is_dir() {
            continue;
        }

        let mut packages = tokio::fs::read_dir(module_dir.path()).await?;
        while let Some(package) = packages.next_entry().await? {
            let file_name = package.file_name();
            let Some(version) = file_name
                .to_str()
                .and_then(|name| parse_package(module_id, name))
            else {
                tracing::debug!(path = %package.path().display(), "Skipping unrecognised file");
                continue;
            };
            catalog.register_version(version)?;
            registered += 1;
        }
    }
    Ok(registered)
}

fn parse_package(module_id: u32, file_name: &str) -> Option<ModuleVersion> {
    let stem = file_name.strip_suffix(".zpg")?;
    let mut parts = stem.split('.').map(str::parse::<u32>);
    let (major, minor, build, revision) = (
        parts.next()?.ok()?,
        parts.next()?.ok()?,
        parts.next()?.ok()?,
        parts.next()?.ok()?,
    );
    if parts.next().is_some() {
        return None;
    }
    Some(ModuleVersion::new(module_id, major, minor, build, revision))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_package() {
        let version = parse_package(7, "1.2.0.5.zpg").unwrap();
        assert_eq!(version, ModuleVersion::new(7, 1, 2, 0, 5));
        assert_eq!(version.storage_locator, "7/1.2.0.5.zpg");

        for bad in ["1.2.0.zpg", "1.2.0.5.6.zpg", "1.2.0.5.zip", "a.2.0.5.zpg"] {
            assert!(parse_package(7, bad).is_none(), "{bad}");
        }
    }
}
