use std::collections::{BTreeMap, BTreeSet, HashSet};

use async_trait::async_trait;
use stc_core::{case_fold, Image, ImageTag, ImageWithTags, NewImage, NewTag, Tag, TagRef};
use tokio::sync::RwLock;

use crate::{CatalogStore, ImageFilter, StoreError, StoreResult};

/// Process-local store with the same constraints as the PostgreSQL schema.
#[derive(Debug, Default)]
pub struct MemoryCatalogStore {
    state: RwLock<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    next_image_id: i64,
    next_tag_id: i64,
    images: BTreeMap<i64, Image>,
    tags: BTreeMap<i64, Tag>,
    edges: BTreeSet<ImageTag>,
}

impl MemoryState {
    fn tags_for(&self, image_id: i64) -> Vec<TagRef> {
        self.edges
            .range(
                ImageTag {
                    image_id,
                    tag_id: i64::MIN,
                }..=ImageTag {
                    image_id,
                    tag_id: i64::MAX,
                },
            )
            .filter_map(|edge| self.tags.get(&edge.tag_id))
            .map(|tag| TagRef {
                tag_id: tag.id,
                name: tag.name.clone(),
            })
            .collect()
    }

    fn matches(&self, image_id: i64, filter: ImageFilter) -> bool {
        match filter {
            ImageFilter::All => true,
            ImageFilter::Tagged(tag_id) => self.edges.contains(&ImageTag { image_id, tag_id }),
        }
    }

    fn with_tags(&self, image: &Image) -> ImageWithTags {
        ImageWithTags {
            image: image.clone(),
            tags: self.tags_for(image.id),
        }
    }
}

impl MemoryCatalogStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CatalogStore for MemoryCatalogStore {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn count_images(&self) -> StoreResult<u64> {
        Ok(self.state.read().await.images.len() as u64)
    }

    async fn image_exists(&self, external_id: &str) -> StoreResult<bool> {
        let state = self.state.read().await;
        Ok(state.images.values().any(|i| i.external_id == external_id))
    }

    async fn insert_image(&self, image: NewImage) -> StoreResult<Image> {
        let mut state = self.state.write().await;
        if state
            .images
            .values()
            .any(|i| i.external_id == image.external_id)
        {
            return Err(StoreError::Conflict {
                constraint: "images_external_id_key".to_string(),
                message: format!("external_id {} already exists", image.external_id),
            });
        }
        state.next_image_id += 1;
        let stored = Image {
            id: state.next_image_id,
            external_id: image.external_id,
            width: image.width,
            height: image.height,
            url: image.url,
            created_at: image.created_at,
        };
        state.images.insert(stored.id, stored.clone());
        Ok(stored)
    }

    async fn list_images(&self) -> StoreResult<Vec<Image>> {
        Ok(self.state.read().await.images.values().cloned().collect())
    }

    async fn tag_names(&self) -> StoreResult<Vec<String>> {
        Ok(self
            .state
            .read()
            .await
            .tags
            .values()
            .map(|t| t.name.clone())
            .collect())
    }

    async fn insert_tags(&self, tags: Vec<NewTag>) -> StoreResult<Vec<Tag>> {
        let mut state = self.state.write().await;
        let mut seen = state
            .tags
            .values()
            .map(|t| case_fold(&t.name))
            .collect::<HashSet<_>>();
        for tag in &tags {
            if !seen.insert(case_fold(&tag.name)) {
                return Err(StoreError::Conflict {
                    constraint: "tags_name_ci".to_string(),
                    message: format!("tag {} already exists", tag.name),
                });
            }
        }

        let mut inserted = Vec::with_capacity(tags.len());
        for tag in tags {
            state.next_tag_id += 1;
            let stored = Tag {
                id: state.next_tag_id,
                name: tag.name,
                created_at: tag.created_at,
            };
            state.tags.insert(stored.id, stored.clone());
            inserted.push(stored);
        }
        Ok(inserted)
    }

    async fn list_tags(&self) -> StoreResult<Vec<Tag>> {
        Ok(self.state.read().await.tags.values().cloned().collect())
    }

    async fn find_tag_by_name(&self, name: &str) -> StoreResult<Option<Tag>> {
        let state = self.state.read().await;
        Ok(state.tags.values().find(|t| t.name == name).cloned())
    }

    async fn list_edges(&self) -> StoreResult<Vec<ImageTag>> {
        Ok(self.state.read().await.edges.iter().copied().collect())
    }

    async fn insert_edges(&self, edges: &[ImageTag]) -> StoreResult<u64> {
        let mut state = self.state.write().await;
        let mut staged = BTreeSet::new();
        for edge in edges {
            if !state.images.contains_key(&edge.image_id) {
                return Err(StoreError::MissingReference(format!(
                    "image {} does not exist",
                    edge.image_id
                )));
            }
            if !state.tags.contains_key(&edge.tag_id) {
                return Err(StoreError::MissingReference(format!(
                    "tag {} does not exist",
                    edge.tag_id
                )));
            }
            if state.edges.contains(edge) || !staged.insert(*edge) {
                return Err(StoreError::Conflict {
                    constraint: "image_tags_pkey".to_string(),
                    message: format!("edge ({}, {}) already exists", edge.image_id, edge.tag_id),
                });
            }
        }
        let inserted = staged.len() as u64;
        state.edges.extend(staged);
        Ok(inserted)
    }

    async fn get_image_with_tags(&self, id: i64) -> StoreResult<Option<ImageWithTags>> {
        let state = self.state.read().await;
        Ok(state.images.get(&id).map(|image| state.with_tags(image)))
    }

    async fn count_matching(&self, filter: ImageFilter) -> StoreResult<u64> {
        let state = self.state.read().await;
        Ok(state
            .images
            .keys()
            .filter(|id| state.matches(**id, filter))
            .count() as u64)
    }

    async fn page_images(
        &self,
        filter: ImageFilter,
        offset: u64,
        limit: u64,
    ) -> StoreResult<Vec<ImageWithTags>> {
        let state = self.state.read().await;
        let offset = usize::try_from(offset).unwrap_or(usize::MAX);
        let limit = usize::try_from(limit).unwrap_or(usize::MAX);
        Ok(state
            .images
            .values()
            .filter(|image| state.matches(image.id, filter))
            .skip(offset)
            .take(limit)
            .map(|image| state.with_tags(image))
            .collect())
    }
}
