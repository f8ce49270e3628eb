use std::sync::Arc;

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;

use crate::auth::TokenService;
use crate::config::Config;
use crate::db;
use crate::uploads::UploadStore;

pub type DbPool = Pool<SqliteConnectionManager>;

/// Everything a handler needs. Built once at startup and read-only after.
#[derive(Clone)]
pub struct AppState {
    pub db: DbPool,
    pub config: Arc<Config>,
    pub tokens: Arc<TokenService>,
    pub uploads: Arc<UploadStore>,
}

impl AppState {
    /// Open the database, apply migrations, prepare the upload directory and
    /// load the signing key. Fails when no signing secret is configured.
    pub fn build(config: Config) -> anyhow::Result<Self> {
        let tokens = TokenService::new(config.signing_secret()?)?;

        let uploads = UploadStore::new(config.uploads_path(), config.storage.max_upload_bytes);
        uploads.ensure_dir()?;

        let pool = db::create_pool(&config.db_path())?;
        db::run_migrations(&pool)?;

        Ok(Self {
            db: pool,
            config: Arc::new(config),
            tokens: Arc::new(tokens),
            uploads: Arc::new(uploads),
        })
    }
}
