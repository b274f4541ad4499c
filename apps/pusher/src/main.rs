use std::sync::Arc;

use anyhow::Context;
use tracing::info;
use upbot::shutdown::shutdown_token;
use upbot::{LibsqlStore, RedisBroker, Scheduler, Settings, SystemClock};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    logger::init_tracing("pusher");

    let settings = Settings::load().context("invalid configuration")?;
    println!("{settings}");

    let redis_url = settings.redis_url()?;
    let database_url = settings.database_url()?;

    let broker = RedisBroker::connect(redis_url, settings.queue_options(), &settings.queue.reconnect)
        .await
        .context("connecting to redis")?;
    broker.ping().await.context("redis did not answer")?;

    let store = LibsqlStore::open(database_url, settings.store.auth_token.as_deref(), settings.store.max_connections)
        .await
        .context("opening result store")?;

    let scheduler = Arc::new(Scheduler::new(
        Arc::new(broker),
        Arc::new(store),
        Arc::new(SystemClock),
        settings.scheduler_options(),
    ));

    let report = scheduler.bootstrap().await.context("bootstrapping schedule index")?;
    info!(
        endpoints = report.endpoints,
        admitted = report.admitted,
        updated = report.updated,
        removed = report.removed,
        rejected = report.rejected,
        "schedule index ready"
    );

    scheduler.run(shutdown_token()).await;
    Ok(())
}
