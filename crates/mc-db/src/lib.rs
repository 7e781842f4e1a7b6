pub mod secrets;

pub use secrets::PgSecretStore;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

/// Create a connection pool to PostgreSQL.
pub async fn create_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(5)
        .connect(database_url)
        .await
}

/// Run embedded migrations.
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}
