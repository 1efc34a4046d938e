use std::collections::HashSet;
use std::sync::Arc;

use stc_core::{Image, ImageTag, Tag};
use stc_storage::CatalogStore;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::{CatalogError, WriteGate};

/// Links every image to every tag, creating only the edges that are missing.
pub struct Linker {
    store: Arc<dyn CatalogStore>,
    gate: WriteGate,
}

impl Linker {
    pub fn new(store: Arc<dyn CatalogStore>, gate: WriteGate) -> Self {
        Self { store, gate }
    }

    /// Returns the number of edges created; zero when every edge exists.
    /// The insert is one transaction: on failure no edge from this call remains.
    pub async fn run(&self) -> Result<u64, CatalogError> {
        let run_id = Uuid::new_v4();
        self.link().instrument(info_span!("link_all", %run_id)).await
    }

    async fn link(&self) -> Result<u64, CatalogError> {
        let _gate = self.gate.lock().await;
        let images = self.store.list_images().await?;
        let tags = self.store.list_tags().await?;
        if images.is_empty() || tags.is_empty() {
            return Err(CatalogError::NothingToLink);
        }

        let existing = self
            .store
            .list_edges()
            .await?
            .into_iter()
            .collect::<HashSet<_>>();
        let staged = missing_edges(&images, &tags, &existing);
        if staged.is_empty() {
            info!(images = images.len(), tags = tags.len(), "all edges already exist");
            return Ok(0);
        }

        match self.store.insert_edges(&staged).await {
            Ok(created) => {
                info!(images = images.len(), tags = tags.len(), created, "linking complete");
                Ok(created)
            }
            Err(err) => {
                warn!(error = %err, staged = staged.len(), "edge transaction rolled back");
                Err(CatalogError::LinkTransactionFailed(err))
            }
        }
    }
}

/// The part of `images × tags` not already in `existing`, ordered by image
/// then tag.
pub fn missing_edges(images: &[Image], tags: &[Tag], existing: &HashSet<ImageTag>) -> Vec<ImageTag> {
    images
        .iter()
        .flat_map(|image| {
            tags.iter().map(move |tag| ImageTag {
                image_id: image.id,
                tag_id: tag.id,
            })
        })
        .filter(|edge| !existing.contains(edge))
        .collect()
}
