use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};
use upbot::shutdown::shutdown_token;
use upbot::store::EndpointSource;
use upbot::{HttpProbeClient, LibsqlStore, RedisBroker, RegionCatalog, Settings, Worker};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    logger::init_tracing("worker");

    let settings = Settings::load().context("invalid configuration")?;
    println!("{settings}");

    let redis_url = settings.redis_url()?;
    let database_url = settings.database_url()?;
    let probe_url = settings.probe_service_url()?;
    // Checked up front so a missing WORKER_ID fails before any connection is opened.
    let worker_id = settings.worker_id()?;

    let store = LibsqlStore::open(database_url, settings.store.auth_token.as_deref(), settings.store.max_connections)
        .await
        .context("opening result store")?;

    let catalog = match store.list_regions().await {
        Ok(regions) if !regions.is_empty() => RegionCatalog::new(regions),
        Ok(_) => RegionCatalog::builtin(),
        Err(e) => {
            warn!(error = %e, "could not read regions, using the built-in catalog");
            RegionCatalog::builtin()
        }
    };
    let options = settings.worker_options(&catalog)?;

    let broker = RedisBroker::connect(redis_url, settings.queue_options(), &settings.queue.reconnect)
        .await
        .context("connecting to redis")?;
    broker.ping().await.context("redis did not answer")?;

    let probe = HttpProbeClient::new(probe_url, options.max_job_timeout).context("building probe client")?;
    info!(
        worker_id,
        probe_url = %probe.url(),
        partitions = options.partitions.len(),
        "worker configured"
    );

    let worker = Worker::new(Arc::new(broker), Arc::new(probe), Arc::new(store), options);
    worker.run(shutdown_token()).await;
    Ok(())
}
