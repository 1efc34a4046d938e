//! Relational store for images, tags and their association edges.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use stc_core::{Image, ImageTag, ImageWithTags, NewImage, NewTag, Tag};
use thiserror::Error;
use tracing::info;

mod memory;
mod pg;

pub use memory::MemoryCatalogStore;
pub use pg::PgCatalogStore;

pub const CRATE_NAME: &str = "stc-storage";

pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("conflict on {constraint}: {message}")]
    Conflict { constraint: String, message: String },
    #[error("missing reference: {0}")]
    MissingReference(String),
    #[error("database error: {0}")]
    Database(sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        if let Some(db_err) = err.as_database_error() {
            let constraint = db_err.constraint().unwrap_or("unknown").to_string();
            if db_err.is_unique_violation() {
                return StoreError::Conflict {
                    constraint,
                    message: db_err.message().to_string(),
                };
            }
            if db_err.is_foreign_key_violation() {
                return StoreError::MissingReference(format!(
                    "{constraint}: {}",
                    db_err.message()
                ));
            }
        }
        StoreError::Database(err)
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Which images a paged scan covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFilter {
    All,
    /// Only images with an edge to this tag id.
    Tagged(i64),
}

/// Durable keyed storage for the three catalog relations.
///
/// Uniqueness (`external_id`, case-folded tag name, `(image_id, tag_id)`) and
/// referential integrity are enforced here; violations surface as
/// [`StoreError::Conflict`] / [`StoreError::MissingReference`].
#[async_trait]
pub trait CatalogStore: Send + Sync {
    fn backend_name(&self) -> &'static str;

    async fn count_images(&self) -> StoreResult<u64>;
    async fn image_exists(&self, external_id: &str) -> StoreResult<bool>;
    async fn insert_image(&self, image: NewImage) -> StoreResult<Image>;
    /// All images ordered by id ascending.
    async fn list_images(&self) -> StoreResult<Vec<Image>>;

    async fn tag_names(&self) -> StoreResult<Vec<String>>;
    /// Inserts every tag in one statement; nothing is written on failure.
    async fn insert_tags(&self, tags: Vec<NewTag>) -> StoreResult<Vec<Tag>>;
    /// All tags ordered by id ascending.
    async fn list_tags(&self) -> StoreResult<Vec<Tag>>;
    /// Exact, case-sensitive name match.
    async fn find_tag_by_name(&self, name: &str) -> StoreResult<Option<Tag>>;

    async fn list_edges(&self) -> StoreResult<Vec<ImageTag>>;
    /// All-or-nothing: either every edge is written or none is.
    async fn insert_edges(&self, edges: &[ImageTag]) -> StoreResult<u64>;

    async fn get_image_with_tags(&self, id: i64) -> StoreResult<Option<ImageWithTags>>;
    async fn count_matching(&self, filter: ImageFilter) -> StoreResult<u64>;
    /// Images ordered by id ascending, each joined with its tags.
    async fn page_images(
        &self,
        filter: ImageFilter,
        offset: u64,
        limit: u64,
    ) -> StoreResult<Vec<ImageWithTags>>;
}

#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_connections: 10,
            acquire_timeout: Duration::from_secs(30),
        }
    }
}

pub async fn connect(database_url: &str, settings: &PoolSettings) -> StoreResult<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(settings.max_connections)
        .acquire_timeout(settings.acquire_timeout)
        .connect(database_url)
        .await
        .map_err(StoreError::Database)?;
    Ok(pool)
}

pub async fn migrate(pool: &PgPool) -> StoreResult<()> {
    MIGRATOR.run(pool).await?;
    info!(migrations = MIGRATOR.iter().count(), "schema migrations applied");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflict_is_distinguishable_from_generic_failure() {
        let conflict = StoreError::Conflict {
            constraint: "images_external_id_key".into(),
            message: "duplicate key".into(),
        };
        assert!(conflict.is_conflict());
        assert!(!StoreError::MissingReference("tags".into()).is_conflict());
        assert!(!StoreError::Database(sqlx::Error::RowNotFound).is_conflict());
    }

    #[test]
    fn non_database_sqlx_errors_stay_generic() {
        let err = StoreError::from(sqlx::Error::PoolTimedOut);
        assert!(matches!(err, StoreError::Database(_)));
    }

    #[test]
    fn migrations_are_embedded() {
        assert!(MIGRATOR.iter().count() >= 1);
    }
}
