use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use stc_adapters::CatSource;
use stc_core::{CatImageRecord, NewImage, FETCH_BATCH_SIZE, IMAGE_CEILING};
use stc_storage::CatalogStore;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::{fetch_upstream, CatalogError, WriteGate};

/// Pulls a batch of images from the source and stores the ones not seen yet,
/// never letting the catalog grow past the ceiling.
pub struct ImageIngestor {
    store: Arc<dyn CatalogStore>,
    source: Arc<dyn CatSource>,
    gate: WriteGate,
    ceiling: u64,
    batch_size: usize,
    upstream_timeout: Duration,
}

impl ImageIngestor {
    pub fn new(store: Arc<dyn CatalogStore>, source: Arc<dyn CatSource>, gate: WriteGate) -> Self {
        Self {
            store,
            source,
            gate,
            ceiling: IMAGE_CEILING,
            batch_size: FETCH_BATCH_SIZE,
            upstream_timeout: Duration::from_secs(20),
        }
    }

    pub fn with_ceiling(mut self, ceiling: u64) -> Self {
        self.ceiling = ceiling;
        self
    }

    pub fn with_upstream_timeout(mut self, timeout: Duration) -> Self {
        self.upstream_timeout = timeout;
        self
    }

    /// Returns the number of images inserted. Rows are inserted one by one;
    /// a failure part-way keeps the rows already written.
    pub async fn run(&self) -> Result<u64, CatalogError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("ingest_images", %run_id, source = self.source.source_id());
        self.ingest().instrument(span).await
    }

    async fn ingest(&self) -> Result<u64, CatalogError> {
        let fetched = fetch_upstream(
            self.upstream_timeout,
            "image batch",
            self.source.fetch_images(self.batch_size),
        )
        .await?;
        let fetched_count = fetched.len();
        let usable = usable_records(fetched);
        if usable.is_empty() {
            return Err(CatalogError::UpstreamUnavailable(format!(
                "source returned no usable images ({fetched_count} fetched)"
            )));
        }

        let _gate = self.gate.lock().await;
        let current = self.store.count_images().await?;
        if current >= self.ceiling {
            return Err(CatalogError::CapacityReached {
                current,
                ceiling: self.ceiling,
            });
        }
        let room = usize::try_from(self.ceiling - current).unwrap_or(usize::MAX);

        let mut seen = HashSet::new();
        let mut inserted = 0u64;
        for record in usable.into_iter().take(room) {
            if !seen.insert(record.external_id.clone()) {
                debug!(external_id = %record.external_id, "duplicate id within batch");
                continue;
            }
            if self.store.image_exists(&record.external_id).await? {
                debug!(external_id = %record.external_id, "image already stored");
                continue;
            }
            match self
                .store
                .insert_image(NewImage::from_record(&record, Utc::now()))
                .await
            {
                Ok(image) => {
                    inserted += 1;
                    debug!(id = image.id, external_id = %image.external_id, "image stored");
                }
                Err(err) if err.is_conflict() => {
                    warn!(external_id = %record.external_id, "image stored concurrently; skipping");
                }
                Err(err) => return Err(err.into()),
            }
        }

        info!(fetched = fetched_count, inserted, before = current, "image ingestion complete");
        Ok(inserted)
    }
}

fn usable_records(records: Vec<CatImageRecord>) -> Vec<CatImageRecord> {
    records
        .into_iter()
        .filter(|record| {
            let usable = record.is_usable();
            if !usable {
                warn!(
                    external_id = %record.external_id,
                    width = record.width,
                    height = record.height,
                    "discarding unusable upstream image"
                );
            }
            usable
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use stc_adapters::StaticSource;
    use stc_storage::MemoryCatalogStore;

    fn record(id: &str) -> CatImageRecord {
        CatImageRecord {
            external_id: id.to_string(),
            width: 640,
            height: 480,
            url: format!("https://cdn2.thecatapi.com/images/{id}.jpg"),
        }
    }

    fn ingestor(store: Arc<MemoryCatalogStore>, source: StaticSource) -> ImageIngestor {
        ImageIngestor::new(store, Arc::new(source), WriteGate::default())
    }

    #[tokio::test]
    async fn takes_only_the_room_left_under_the_ceiling() {
        let store = Arc::new(MemoryCatalogStore::new());
        let first = StaticSource::new((0..20).map(|i| record(&format!("a{i}"))).collect(), vec![]);
        assert_eq!(ingestor(store.clone(), first).run().await.unwrap(), 20);

        let second = StaticSource::new((0..25).map(|i| record(&format!("b{i}"))).collect(), vec![]);
        assert_eq!(ingestor(store.clone(), second).run().await.unwrap(), 5);

        let images = store.list_images().await.unwrap();
        assert_eq!(images.len(), 25);
        assert_eq!(images.last().unwrap().external_id, "b4");
    }

    #[tokio::test]
    async fn full_catalog_is_rejected_without_mutation() {
        let store = Arc::new(MemoryCatalogStore::new());
        let source = StaticSource::new(vec![record("a"), record("b"), record("c")], vec![]);
        let ingestor = ingestor(store.clone(), source).with_ceiling(2);
        assert_eq!(ingestor.run().await.unwrap(), 2);

        let err = ingestor.run().await.unwrap_err();
        assert!(matches!(
            err,
            CatalogError::CapacityReached { current: 2, ceiling: 2 }
        ));
        assert_eq!(store.count_images().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn duplicates_within_a_batch_are_inserted_once() {
        let store = Arc::new(MemoryCatalogStore::new());
        let source = StaticSource::new(vec![record("a"), record("a"), record("b")], vec![]);
        assert_eq!(ingestor(store.clone(), source).run().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn empty_or_unusable_batches_are_upstream_failures() {
        let store = Arc::new(MemoryCatalogStore::new());
        let err = ingestor(store.clone(), StaticSource::default())
            .run()
            .await
            .unwrap_err();
        assert!(matches!(err, CatalogError::UpstreamUnavailable(_)));

        let mut broken = record("z");
        broken.height = 0;
        let err = ingestor(store.clone(), StaticSource::new(vec![broken], vec![]))
            .run()
            .await
            .unwrap_err();
        assert!(matches!(err, CatalogError::UpstreamUnavailable(_)));

        let err = ingestor(store.clone(), StaticSource::unavailable())
            .run()
            .await
            .unwrap_err();
        assert!(matches!(err, CatalogError::UpstreamUnavailable(_)));
        assert_eq!(store.count_images().await.unwrap(), 0);
    }
}
