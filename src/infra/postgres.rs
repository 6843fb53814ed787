pub mod audit_repo;
pub mod enrollment_repo;
pub mod invoice_repo;
pub mod payment_repo;

use {
    sqlx::{PgPool, postgres::PgPoolOptions},
    std::time::Duration,
};

pub async fn connect(database_url: &str, max_connections: u32) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(3))
        .connect(database_url)
        .await
}

pub async fn migrate(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}
