use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::info;
use tracing_subscriber::EnvFilter;

use slice_orchestrator::audit::ApiAuditLogger;
use slice_orchestrator::auth::JwtVerifier;
use slice_orchestrator::config::Args;
use slice_orchestrator::domain::Zone;
use slice_orchestrator::drivers::{Driver, LinuxDriver, OpenstackDriver};
use slice_orchestrator::images::{ImageCatalogClient, OpenstackImageClient};
use slice_orchestrator::lifecycle::SliceLocks;
use slice_orchestrator::orchestrator::{run_placement_worker, run_vlan_worker};
use slice_orchestrator::placement::ZoneLocks;
use slice_orchestrator::queue::{MemoryQueue, NatsQueue, Queue};
use slice_orchestrator::rest::{create_router, AppState};
use slice_orchestrator::store::{DataStore, Event, MemoryStore, PostgresStore};
use slice_orchestrator::telemetry::TelemetryClient;

/// Event bus capacity (§4.8): large enough that a slow `create_slice`
/// subscriber never lags behind the worker loops under normal load.
const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("slice_orchestrator=info".parse()?))
        .init();

    let args = Args::parse();

    let store: Arc<dyn DataStore> = if args.dev {
        info!("running in --dev mode: in-memory store, no Postgres connection");
        Arc::new(MemoryStore::new())
    } else {
        let pg = PostgresStore::connect(&args.database_url).await?;
        pg.migrate().await?;
        Arc::new(pg)
    };

    let queue: Arc<dyn Queue> = if args.dev {
        info!("running in --dev mode: in-memory queue, no NATS connection");
        Arc::new(MemoryQueue::new())
    } else {
        Arc::new(NatsQueue::connect(&args.nats_url).await?)
    };

    let telemetry = Arc::new(TelemetryClient::new(args.prometheus_url.clone()));

    let linux_driver = LinuxDriver::new(
        args.linux_workers.clone(),
        args.linux_agent_token.clone(),
        store.clone(),
    );
    let openstack_driver = OpenstackDriver::new(
        args.openstack_url.clone(),
        args.openstack_admin_token.clone(),
        args.openstack_internet_network_id.clone(),
        args.openstack_workers.clone(),
        store.clone(),
    );
    let driver = Arc::new(Driver::new(linux_driver, openstack_driver));

    let jwt = JwtVerifier::new(&args.jwt_secret);
    let audit = Arc::new(ApiAuditLogger::new());
    let slice_locks = Arc::new(SliceLocks::new());
    let zone_locks = Arc::new(ZoneLocks::new());
    let images_dir = Arc::new(PathBuf::from("./images"));
    tokio::fs::create_dir_all(images_dir.as_path()).await?;
    let image_catalog = Arc::new(ImageCatalogClient::new(args.image_catalog_url.clone()));
    let openstack_images = Arc::new(OpenstackImageClient::new(
        args.openstack_url.clone(),
        args.openstack_admin_token.clone(),
    ));

    let (events, _rx) = broadcast::channel::<Event>(EVENT_CHANNEL_CAPACITY);

    for zone in [Zone::Linux, Zone::Openstack] {
        tokio::spawn(run_vlan_worker(
            zone,
            store.clone(),
            queue.clone(),
            events.clone(),
            audit.clone(),
        ));

        let workers: Vec<String> = args.workers_for(zone).keys().cloned().collect();
        tokio::spawn(run_placement_worker(
            zone,
            store.clone(),
            driver.clone(),
            telemetry.clone(),
            zone_locks.clone(),
            queue.clone(),
            events.clone(),
            audit.clone(),
            workers,
            args.headnode_instance_for(zone).to_string(),
        ));
    }

    let state = AppState {
        store,
        queue,
        driver,
        audit,
        jwt,
        events,
        slice_locks,
        images_dir,
        image_catalog,
        openstack_images,
    };

    let app = create_router(state);
    let listener = tokio::net::TcpListener::bind(&args.listen).await?;
    info!(listen = %args.listen, "slice orchestrator listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}
