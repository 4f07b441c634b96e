//! vigild — Vigil peer-communication daemon.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;

use vigil_core::config::VigilConfig;
use vigil_core::identity::IdentityRegistry;
use vigil_core::wire::PROTOCOL_AUDIT;
use vigil_services::{AgreementTracker, PartnerList, PeerStateStore, ReputationTable};

use vigild::datagram::DatagramTransport;
use vigild::dispatch::{run_stream_dispatcher, HandlerRegistry};
use vigild::pool::ChannelManager;
use vigild::router::Router;
use vigild::store::DirStateStore;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    if let Err(e) = VigilConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = VigilConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        VigilConfig::default()
    });

    // The worker pool bounds carry over to the runtime builder: a floor of
    // worker threads, a ceiling on blocking helpers, and the idle reap.
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.pool.min_threads.max(1))
        .max_blocking_threads(config.pool.max_blocking_threads.max(1))
        .thread_keep_alive(Duration::from_millis(config.pool.keepalive_ms))
        .enable_all()
        .build()
        .context("failed to build runtime")?;
    runtime.block_on(run(config))
}

async fn run(config: VigilConfig) -> Result<()> {
    tracing::info!(local = %config.identity.local_key, "vigild starting");

    let registry = Arc::new(
        IdentityRegistry::new(&config.identity.local_key)
            .context("local identity key does not parse")?,
    );
    let local_ip = registry.local().address().ip();

    // Peer state: reputation and agreement history, reloaded from disk
    let state_store: Arc<dyn PeerStateStore> = Arc::new(
        DirStateStore::new(&config.identity.state_dir).context("failed to open state dir")?,
    );
    let reputation = Arc::new(ReputationTable::new(config.reputation.clone()));
    if let Err(e) = reputation.load(state_store.as_ref()) {
        tracing::warn!(error = %e, "couldn't reload reputation table");
    }
    let agreement = Arc::new(AgreementTracker::new());
    let partners = Arc::new(PartnerList::new(config.partner.clone()));

    // ── Shutdown channel ─────────────────────────────────────────────────────
    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);

    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    // ── Stream side: channel pool, listener, dispatcher ──────────────────────

    let (manager, rcv_rx) = ChannelManager::new(config.stream.clone(), registry.clone());

    let listener = TcpListener::bind(("0.0.0.0", config.stream.listen_port))
        .await
        .context("failed to bind channel listener")?;
    tracing::info!(addr = %listener.local_addr()?, "channel listener bound");

    let stream_handlers = Arc::new(HandlerRegistry::new());
    // The poll/vote layer registers its protocol ids here; nothing is
    // claimed by the transport itself.

    let listener_task = {
        let manager = manager.clone();
        let shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move { manager.run_listener(listener, shutdown).await })
    };

    let hung_check_task = {
        let manager = manager.clone();
        let shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move { manager.run_hung_check(shutdown).await })
    };

    let dispatcher_task = tokio::spawn(run_stream_dispatcher(
        rcv_rx,
        stream_handlers.clone(),
        shutdown_tx.subscribe(),
    ));

    // ── Datagram side: transport, router, beacon ─────────────────────────────

    let datagram_handlers = Arc::new(HandlerRegistry::new());
    let transport = DatagramTransport::bind(
        config.datagram.clone(),
        local_ip,
        datagram_handlers.clone(),
    )
    .await
    .context("failed to start datagram transport")?;
    tracing::info!(port = transport.local_port()?, "datagram transport bound");

    let router = Router::new(
        config.router.clone(),
        registry.clone(),
        partners.clone(),
        Arc::new(transport.clone()),
    );
    {
        let router = router.clone();
        datagram_handlers
            .register(PROTOCOL_AUDIT, Arc::new(move |dg| router.handle_datagram(dg)))
            .expect("audit protocol registered twice");
    }

    let _receiver_tasks = transport.spawn_receivers(&shutdown_tx);
    let beacon_task = tokio::spawn(router.clone().run_beacon(shutdown_tx.subscribe()));

    let status_task = {
        let manager = manager.clone();
        let registry = registry.clone();
        let partners = partners.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            loop {
                interval.tick().await;
                tracing::info!(
                    channels = manager.live_channels(),
                    peers = registry.len(),
                    partners = partners.len(),
                    "comm status"
                );
            }
        })
    };

    // ── Wait for exit ────────────────────────────────────────────────────────

    let mut shutdown_rx = shutdown_tx.subscribe();

    tokio::select! {
        _ = shutdown_rx.recv()  => tracing::info!("shutting down"),
        r = listener_task       => tracing::error!("channel listener exited: {r:?}"),
        r = hung_check_task     => tracing::error!("hung-channel scan exited: {r:?}"),
        r = dispatcher_task     => tracing::error!("stream dispatcher exited: {r:?}"),
        r = beacon_task         => tracing::error!("beacon exited: {r:?}"),
        r = status_task         => tracing::error!("status reporter exited: {r:?}"),
    }

    manager.stop_all();
    if let Err(e) = reputation.store(state_store.as_ref()) {
        tracing::warn!(error = %e, "couldn't flush reputation table");
    }
    for unit in agreement.unit_ids() {
        if let Err(e) = agreement.store_unit(&unit, state_store.as_ref()) {
            tracing::warn!(unit = %unit, error = %e, "couldn't flush agreement map");
        }
    }

    Ok(())
}
