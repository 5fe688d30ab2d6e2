//! Store backends for the Conveyor CI control plane.
//!
//! The repository traits in [`repo`] are the only storage surface the
//! queue engine and log pipeline consume. Two backends are provided:
//! PostgreSQL ([`postgres::PgStore`]) and in-memory
//! ([`memory::MemoryStore`], also the blob store used in tests).

pub mod error;
pub mod memory;
pub mod postgres;
pub mod repo;

pub use error::{DbError, DbResult};
pub use memory::{MemoryBlobStore, MemoryStore};
pub use postgres::PgStore;
pub use repo::*;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

/// Create a new database connection pool.
pub async fn create_pool(database_url: &str) -> DbResult<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await?;
    Ok(pool)
}

/// Run database migrations.
pub async fn run_migrations(pool: &PgPool) -> DbResult<()> {
    tracing::info!("running database migrations");
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}
