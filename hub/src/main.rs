//! Hub entrypoint: one binary running the axum HTTP/WS server and the
//! rollup cron scheduler concurrently (spec §2).

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use beszel_hub::alerts::AlertEngine;
use beszel_hub::config::Config;
use beszel_hub::db::{self, RecordStore};
use beszel_hub::http::{self, HubState};
use beszel_hub::manager::SystemManager;
use beszel_hub::rollup;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env();
    std::fs::create_dir_all(&config.data_dir).context("create data dir")?;

    let store: Arc<dyn RecordStore> = match &config.database_url {
        Some(url) => {
            let pool = db::connect(url).await.context("connect to postgres")?;
            db::init_schema(&pool).await.context("init schema")?;
            if config.reset_db {
                db::reset_db(&pool).await.context("reset db")?;
            }
            Arc::new(db::PgStore::new(pool))
        }
        None => {
            tracing::warn!("DATABASE_URL not set, running with an in-memory store");
            Arc::new(db::InMemoryStore::new())
        }
    };

    let alerts = AlertEngine::new(Arc::clone(&store));
    let manager = SystemManager::new(Arc::clone(&store), &config, Arc::clone(&alerts))?;
    manager.reconcile_roster().await.context("reconcile worker roster")?;

    let state = Arc::new(HubState {
        manager: Arc::clone(&manager),
        store: Arc::clone(&store),
        disable_password_auth: config.disable_password_auth,
        csp: config.csp.clone(),
    });
    let app = http::router(state);

    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    tracing::info!(addr = %config.listen_addr, "hub listening");

    let scheduler = rollup::spawn_scheduler(Arc::clone(&store)).await.context("start rollup scheduler")?;

    let serve = axum::serve(listener, app);
    tokio::select! {
        result = serve => result.context("http server exited")?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown requested");
        }
    }

    scheduler.shutdown().await.ok();
    Ok(())
}
