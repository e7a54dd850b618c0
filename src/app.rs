use crate::{
    api::{self, ApiState},
    config::Config,
    engine::{CATALOG_DIR, HttpBlockFetcher, Registry},
    identity,
    single_instance::{LOCK_FILE, SingleInstanceLock},
    tracker::TrackerClient,
};
use anyhow::Context;
use std::{future::Future, sync::Arc, time::Duration};
use tokio::sync::watch;

pub async fn run(config: Config) -> anyhow::Result<()> {
    run_until(config, async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %err, "failed to listen for ctrl-c; running until killed");
            std::future::pending::<()>().await;
        }
        tracing::info!("ctrl-c received");
    })
    .await
}

/// Runs a node until `shutdown` resolves or one of its listeners fails.
pub async fn run_until(
    config: Config,
    shutdown: impl Future<Output = ()> + Send,
) -> anyhow::Result<()> {
    let root = config.root_path();
    tracing::info!(
        log = %config.general.log_level,
        root = %root.display(),
        "starting node"
    );
    let catalog_root = root.join(CATALOG_DIR);
    let lock = SingleInstanceLock::acquire(catalog_root.join(LOCK_FILE))?;
    tracing::debug!(lock = %lock.path().display(), "acquired root lock");

    let peer_id = if config.general.peer_id.is_empty() {
        let path = catalog_root.join("peer_id");
        identity::load_or_create_peer_id(&path)
            .await
            .with_context(|| format!("failed to load peer id from {}", path.display()))?
    } else {
        config.general.peer_id.to_ascii_lowercase()
    };
    tracing::info!(peer_id = %peer_id, "node identity loaded");

    let tracker = if config.tracker.enabled {
        Some(
            TrackerClient::new(
                &config.tracker.host,
                config.tracker.port,
                &peer_id,
                config.bt.port,
                Duration::from_secs(config.tracker.timeout_secs),
            )
            .context("failed to build tracker client")?,
        )
    } else {
        tracing::info!("tracker disabled; only seed peers will be used");
        None
    };

    let fetcher = HttpBlockFetcher::new(
        tracker.clone(),
        config.bt.seed_peers.clone(),
        Duration::from_secs(config.tracker.announce_every_secs),
        Duration::from_secs(config.engine.fetch_timeout_secs),
    )
    .context("failed to build block fetcher")?;
    let registry = Arc::new(
        Registry::create(config.registry_config(), Arc::new(fetcher))
            .await
            .context("failed to load task registry")?,
    );

    let state = ApiState::new(Arc::clone(&registry), tracker);
    let (stop_tx, stop_rx) = watch::channel(false);
    let mut bt = tokio::spawn(api::serve(
        "bt",
        api::bind_addr(&config.bt.host, config.bt.port)?,
        api::bt_router(state.clone()),
        wait_for_stop(stop_rx.clone()),
    ));
    let mut admin = tokio::spawn(api::serve(
        "admin",
        api::bind_addr(&config.api.host, config.api.port)?,
        api::admin_router(state),
        wait_for_stop(stop_rx),
    ));

    let outcome = tokio::select! {
        _ = shutdown => Ok(()),
        res = &mut bt => server_exit("bt", res),
        res = &mut admin => server_exit("admin", res),
    };

    let _ = stop_tx.send(true);
    registry.shutdown().await;
    for handle in [bt, admin] {
        if !handle.is_finished() {
            let _ = handle.await;
        }
    }
    drop(lock);
    tracing::info!("node stopped");
    outcome
}

async fn wait_for_stop(mut rx: watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}

fn server_exit(
    name: &str,
    res: Result<anyhow::Result<()>, tokio::task::JoinError>,
) -> anyhow::Result<()> {
    match res {
        Ok(Ok(())) => Err(anyhow::anyhow!("{name} server exited unexpectedly")),
        Ok(Err(err)) => Err(err.context(format!("{name} server failed"))),
        Err(err) => Err(anyhow::anyhow!("{name} server task panicked: {err}")),
    }
}
