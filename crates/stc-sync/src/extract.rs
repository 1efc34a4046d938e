use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use stc_adapters::CatSource;
use stc_core::{case_fold, BreedRecord, NewTag};
use stc_storage::CatalogStore;
use tracing::{debug, info, info_span, Instrument};
use uuid::Uuid;

use crate::{fetch_upstream, CatalogError, WriteGate};

/// Turns breed temperaments into tags, deduplicated case-insensitively against
/// the stored tags and within the batch.
pub struct TagExtractor {
    store: Arc<dyn CatalogStore>,
    source: Arc<dyn CatSource>,
    gate: WriteGate,
    upstream_timeout: Duration,
}

impl TagExtractor {
    pub fn new(store: Arc<dyn CatalogStore>, source: Arc<dyn CatSource>, gate: WriteGate) -> Self {
        Self {
            store,
            source,
            gate,
            upstream_timeout: Duration::from_secs(20),
        }
    }

    pub fn with_upstream_timeout(mut self, timeout: Duration) -> Self {
        self.upstream_timeout = timeout;
        self
    }

    pub async fn run(&self) -> Result<u64, CatalogError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("extract_tags", %run_id, source = self.source.source_id());
        self.extract().instrument(span).await
    }

    async fn extract(&self) -> Result<u64, CatalogError> {
        let breeds =
            fetch_upstream(self.upstream_timeout, "breed list", self.source.fetch_breeds()).await?;
        if breeds.is_empty() {
            return Err(CatalogError::UpstreamUnavailable(
                "source returned no breeds".to_string(),
            ));
        }

        let _gate = self.gate.lock().await;
        let existing = self.store.tag_names().await?;
        let staged = stage_new_tags(&existing, &breeds);
        if staged.is_empty() {
            info!(breeds = breeds.len(), "no new tags");
            return Ok(0);
        }

        let inserted = self.store.insert_tags(staged).await?;
        info!(breeds = breeds.len(), inserted = inserted.len(), "tag extraction complete");
        Ok(inserted.len() as u64)
    }
}

/// New tags in first-seen order, original casing kept. A name is skipped when
/// its case-folded form matches an existing tag or an earlier candidate.
pub(crate) fn stage_new_tags(existing: &[String], breeds: &[BreedRecord]) -> Vec<NewTag> {
    let mut known = existing.iter().map(|n| case_fold(n)).collect::<HashSet<_>>();
    let mut staged = Vec::new();
    for breed in breeds {
        for name in breed.temperament_tags() {
            if known.insert(case_fold(&name)) {
                staged.push(NewTag {
                    name,
                    created_at: Utc::now(),
                });
            } else {
                debug!(breed = %breed.name, tag = %name, "tag already known");
            }
        }
    }
    staged
}

#[cfg(test)]
mod tests {
    use super::*;
    use stc_adapters::StaticSource;
    use stc_storage::MemoryCatalogStore;

    fn breed(name: &str, temperament: Option<&str>) -> BreedRecord {
        BreedRecord {
            name: name.to_string(),
            temperament: temperament.map(ToString::to_string),
        }
    }

    fn names(tags: &[NewTag]) -> Vec<&str> {
        tags.iter().map(|t| t.name.as_str()).collect()
    }

    #[test]
    fn staging_collapses_case_variants_across_breeds() {
        let breeds = vec![
            breed("A", Some("Calm, Playful")),
            breed("B", Some("calm, Loyal")),
            breed("C", None),
            breed("D", Some(" , PLAYFUL,  ")),
        ];
        assert_eq!(names(&stage_new_tags(&[], &breeds)), vec!["Calm", "Playful", "Loyal"]);
    }

    #[test]
    fn staging_skips_names_already_stored() {
        let existing = vec!["LOYAL".to_string()];
        let breeds = vec![breed("A", Some("Loyal, Quiet"))];
        assert_eq!(names(&stage_new_tags(&existing, &breeds)), vec!["Quiet"]);
    }

    #[tokio::test]
    async fn repeated_extraction_writes_nothing_new() {
        let store = Arc::new(MemoryCatalogStore::new());
        let source = Arc::new(StaticSource::new(
            vec![],
            vec![breed("A", Some("Calm, Playful")), breed("B", Some("calm, Loyal"))],
        ));
        let extractor = TagExtractor::new(store.clone(), source, WriteGate::default());

        assert_eq!(extractor.run().await.unwrap(), 3);
        assert_eq!(extractor.run().await.unwrap(), 0);
        assert_eq!(store.tag_names().await.unwrap(), vec!["Calm", "Playful", "Loyal"]);
    }

    #[tokio::test]
    async fn breeds_without_any_temperament_succeed_with_zero() {
        let store = Arc::new(MemoryCatalogStore::new());
        let source = Arc::new(StaticSource::new(vec![], vec![breed("A", None), breed("B", Some(""))]));
        let extractor = TagExtractor::new(store.clone(), source, WriteGate::default());
        assert_eq!(extractor.run().await.unwrap(), 0);
        assert!(store.list_tags().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn empty_breed_list_is_an_upstream_failure() {
        let store = Arc::new(MemoryCatalogStore::new());
        let extractor = TagExtractor::new(store, Arc::new(StaticSource::default()), WriteGate::default());
        assert!(matches!(
            extractor.run().await.unwrap_err(),
            CatalogError::UpstreamUnavailable(_)
        ));
    }
}
