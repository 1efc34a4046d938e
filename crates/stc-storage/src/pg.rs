use std::collections::BTreeMap;

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgRow};
use sqlx::{Postgres, QueryBuilder, Row};
use stc_core::{Image, ImageTag, ImageWithTags, NewImage, NewTag, Tag, TagRef};
use tracing::debug;

use crate::{CatalogStore, ImageFilter, StoreResult};

/// Two binds per edge keeps each statement far below the 65535 parameter cap.
const EDGE_INSERT_CHUNK: usize = 1000;

const IMAGE_COLUMNS: &str = "id, external_id, width, height, url, created_at";

#[derive(Debug, Clone)]
pub struct PgCatalogStore {
    pool: PgPool,
}

impl PgCatalogStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn tags_for_images(&self, image_ids: &[i64]) -> StoreResult<BTreeMap<i64, Vec<TagRef>>> {
        let mut out: BTreeMap<i64, Vec<TagRef>> = BTreeMap::new();
        if image_ids.is_empty() {
            return Ok(out);
        }
        let rows = sqlx::query(
            r#"
            SELECT it.image_id, t.id AS tag_id, t.name
              FROM image_tags it
              JOIN tags t ON t.id = it.tag_id
             WHERE it.image_id = ANY($1)
             ORDER BY it.image_id, t.id
            "#,
        )
        .bind(image_ids.to_vec())
        .fetch_all(&self.pool)
        .await?;

        for row in rows {
            let image_id: i64 = row.try_get("image_id")?;
            out.entry(image_id).or_default().push(TagRef {
                tag_id: row.try_get("tag_id")?,
                name: row.try_get("name")?,
            });
        }
        Ok(out)
    }

    async fn join_tags(&self, images: Vec<Image>) -> StoreResult<Vec<ImageWithTags>> {
        let ids = images.iter().map(|i| i.id).collect::<Vec<_>>();
        let mut tags = self.tags_for_images(&ids).await?;
        Ok(images
            .into_iter()
            .map(|image| ImageWithTags {
                tags: tags.remove(&image.id).unwrap_or_default(),
                image,
            })
            .collect())
    }
}

fn image_from_row(row: &PgRow) -> Result<Image, sqlx::Error> {
    Ok(Image {
        id: row.try_get("id")?,
        external_id: row.try_get("external_id")?,
        width: row.try_get("width")?,
        height: row.try_get("height")?,
        url: row.try_get("url")?,
        created_at: row.try_get("created_at")?,
    })
}

fn tag_from_row(row: &PgRow) -> Result<Tag, sqlx::Error> {
    Ok(Tag {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        created_at: row.try_get("created_at")?,
    })
}

fn filter_tag_id(filter: ImageFilter) -> Option<i64> {
    match filter {
        ImageFilter::All => None,
        ImageFilter::Tagged(tag_id) => Some(tag_id),
    }
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

#[async_trait]
impl CatalogStore for PgCatalogStore {
    fn backend_name(&self) -> &'static str {
        "postgres"
    }

    async fn count_images(&self) -> StoreResult<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM images")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }

    async fn image_exists(&self, external_id: &str) -> StoreResult<bool> {
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM images WHERE external_id = $1)")
                .bind(external_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(exists)
    }

    async fn insert_image(&self, image: NewImage) -> StoreResult<Image> {
        let row = sqlx::query(
            r#"
            INSERT INTO images (external_id, width, height, url, created_at)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id, external_id, width, height, url, created_at
            "#,
        )
        .bind(&image.external_id)
        .bind(image.width)
        .bind(image.height)
        .bind(&image.url)
        .bind(image.created_at)
        .fetch_one(&self.pool)
        .await?;
        Ok(image_from_row(&row)?)
    }

    async fn list_images(&self) -> StoreResult<Vec<Image>> {
        let rows = sqlx::query(&format!("SELECT {IMAGE_COLUMNS} FROM images ORDER BY id"))
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(image_from_row).collect::<Result<_, _>>()?)
    }

    async fn tag_names(&self) -> StoreResult<Vec<String>> {
        let names: Vec<String> = sqlx::query_scalar("SELECT name FROM tags ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        Ok(names)
    }

    async fn insert_tags(&self, tags: Vec<NewTag>) -> StoreResult<Vec<Tag>> {
        if tags.is_empty() {
            return Ok(Vec::new());
        }
        let mut builder: QueryBuilder<Postgres> =
            QueryBuilder::new("INSERT INTO tags (name, created_at) ");
        builder.push_values(tags, |mut row, tag| {
            row.push_bind(tag.name).push_bind(tag.created_at);
        });
        builder.push(" RETURNING id, name, created_at");

        let rows = builder.build().fetch_all(&self.pool).await?;
        let mut inserted = rows.iter().map(tag_from_row).collect::<Result<Vec<_>, _>>()?;
        inserted.sort_by_key(|t| t.id);
        Ok(inserted)
    }

    async fn list_tags(&self) -> StoreResult<Vec<Tag>> {
        let rows = sqlx::query("SELECT id, name, created_at FROM tags ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(tag_from_row).collect::<Result<_, _>>()?)
    }

    async fn find_tag_by_name(&self, name: &str) -> StoreResult<Option<Tag>> {
        let row = sqlx::query("SELECT id, name, created_at FROM tags WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(tag_from_row).transpose()?)
    }

    async fn list_edges(&self) -> StoreResult<Vec<ImageTag>> {
        let rows = sqlx::query("SELECT image_id, tag_id FROM image_tags ORDER BY image_id, tag_id")
            .fetch_all(&self.pool)
            .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(ImageTag {
                image_id: row.try_get("image_id")?,
                tag_id: row.try_get("tag_id")?,
            });
        }
        Ok(out)
    }

    async fn insert_edges(&self, edges: &[ImageTag]) -> StoreResult<u64> {
        if edges.is_empty() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0u64;

        for chunk in edges.chunks(EDGE_INSERT_CHUNK) {
            let mut builder: QueryBuilder<Postgres> =
                QueryBuilder::new("INSERT INTO image_tags (image_id, tag_id) ");
            builder.push_values(chunk, |mut row, edge| {
                row.push_bind(edge.image_id).push_bind(edge.tag_id);
            });

            match builder.build().execute(&mut *tx).await {
                Ok(done) => inserted += done.rows_affected(),
                Err(err) => {
                    debug!(error = %err, "edge insert failed; rolling back");
                    tx.rollback().await?;
                    return Err(err.into());
                }
            }
        }

        tx.commit().await?;
        Ok(inserted)
    }

    async fn get_image_with_tags(&self, id: i64) -> StoreResult<Option<ImageWithTags>> {
        let row = sqlx::query(&format!("SELECT {IMAGE_COLUMNS} FROM images WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let image = image_from_row(&row)?;
        Ok(self.join_tags(vec![image]).await?.into_iter().next())
    }

    async fn count_matching(&self, filter: ImageFilter) -> StoreResult<u64> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*)
              FROM images
             WHERE $1::BIGINT IS NULL
                OR id IN (SELECT image_id FROM image_tags WHERE tag_id = $1)
            "#,
        )
        .bind(filter_tag_id(filter))
        .fetch_one(&self.pool)
        .await?;
        Ok(count.max(0) as u64)
    }

    async fn page_images(
        &self,
        filter: ImageFilter,
        offset: u64,
        limit: u64,
    ) -> StoreResult<Vec<ImageWithTags>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {IMAGE_COLUMNS}
              FROM images
             WHERE $1::BIGINT IS NULL
                OR id IN (SELECT image_id FROM image_tags WHERE tag_id = $1)
             ORDER BY id
             LIMIT $2 OFFSET $3
            "#
        ))
        .bind(filter_tag_id(filter))
        .bind(to_i64(limit))
        .bind(to_i64(offset))
        .fetch_all(&self.pool)
        .await?;

        let images = rows.iter().map(image_from_row).collect::<Result<Vec<_>, _>>()?;
        self.join_tags(images).await
    }
}
