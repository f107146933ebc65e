use std::sync::Arc;
use actix_web::{web, App, HttpServer};
use actix_web::middleware::Logger;
use tracing_subscriber::EnvFilter;

use school_fees::auth::SessionKeys;
use school_fees::config::{Settings, StorageBackend};
use school_fees::db::ScyllaConnector;
use school_fees::memory::MemoryStore;
use school_fees::server;
use school_fees::state::StoreStateManager;
use school_fees::store::FeeStore;

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    dotenv::dotenv().ok();

    let settings = Settings::load()?;

    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&settings.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
    tracing::info!("Starting school fees service");

    settings.validate()?;

    let store: Arc<dyn FeeStore> = match settings.storage.backend {
        StorageBackend::Scylla => {
            let db = ScyllaConnector::new(&settings.database).await?;
            db.init_schema(&settings.database).await?;
            Arc::new(db)
        }
        StorageBackend::Memory => {
            tracing::warn!("Using the in-memory store; data is lost on exit");
            Arc::new(MemoryStore::new())
        }
    };

    let keys = SessionKeys::new(&settings.auth);
    let state_manager = Arc::new(StoreStateManager::new(store.clone(), keys.clone(), settings.bulk.clone()));

    let state_data = web::Data::new(state_manager);
    let keys_data = web::Data::new(keys);

    let address = settings.bind_address();
    tracing::info!("Starting HTTP server on {}", address);
    let server = HttpServer::new(move || {
        App::new()
            .app_data(state_data.clone())
            .app_data(keys_data.clone())
            .wrap(Logger::default())
            .configure(server::configure)
    })
    .bind(&address)?
    .run();

    // Wait for server to finish
    server.await?;

    store.shutdown().await?;
    tracing::info!("Shut down cleanly");
    Ok(())
}
