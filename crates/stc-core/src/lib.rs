//! Core domain model for the cat image catalog.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "stc-core";

/// Maximum number of Image rows the catalog will ever hold.
pub const IMAGE_CEILING: u64 = 25;

/// Number of records requested from the external source per ingestion call.
pub const FETCH_BATCH_SIZE: usize = 25;

pub const DEFAULT_PAGE: u32 = 1;
pub const DEFAULT_PAGE_SIZE: u32 = 10;

/// Persisted image row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Image {
    pub id: i64,
    pub external_id: String,
    pub width: i32,
    pub height: i32,
    pub url: String,
    pub created_at: DateTime<Utc>,
}

/// Image staged for insertion; the store assigns the surrogate id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewImage {
    pub external_id: String,
    pub width: i32,
    pub height: i32,
    pub url: String,
    pub created_at: DateTime<Utc>,
}

impl NewImage {
    pub fn from_record(record: &CatImageRecord, created_at: DateTime<Utc>) -> Self {
        Self {
            external_id: record.external_id.clone(),
            width: record.width,
            height: record.height,
            url: record.url.clone(),
            created_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    pub id: i64,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTag {
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// Association edge between one image and one tag, identified by the pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ImageTag {
    pub image_id: i64,
    pub tag_id: i64,
}

/// Tag as seen from an image: the edge resolved to id + name, no back-reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagRef {
    pub tag_id: i64,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageWithTags {
    pub image: Image,
    pub tags: Vec<TagRef>,
}

/// Image record as returned by the external source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatImageRecord {
    pub external_id: String,
    pub width: i32,
    pub height: i32,
    pub url: String,
}

impl CatImageRecord {
    /// Records without an id or with non-positive dimensions cannot be stored.
    pub fn is_usable(&self) -> bool {
        !self.external_id.trim().is_empty() && self.width > 0 && self.height > 0
    }
}

/// Breed record as returned by the external source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreedRecord {
    pub name: String,
    pub temperament: Option<String>,
}

impl BreedRecord {
    pub fn temperament_tags(&self) -> Vec<String> {
        self.temperament
            .as_deref()
            .map(split_temperament)
            .unwrap_or_default()
    }
}

/// Split a comma-separated temperament string into trimmed, non-empty names.
/// Original casing is preserved.
pub fn split_temperament(temperament: &str) -> Vec<String> {
    temperament
        .split(',')
        .map(str::trim)
        .filter(|piece| !piece.is_empty())
        .map(ToString::to_string)
        .collect()
}

/// Lowercased form used for case-insensitive tag comparison.
pub fn case_fold(name: &str) -> String {
    name.to_lowercase()
}

/// Validated 1-based page request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    page: u64,
    page_size: u64,
}

impl PageRequest {
    /// Both bounds must be at least 1.
    pub fn new(page: i64, page_size: i64) -> Result<Self, String> {
        if page < 1 || page_size < 1 {
            return Err("page and pageSize must be greater than 0".to_string());
        }
        Ok(Self {
            page: page.unsigned_abs(),
            page_size: page_size.unsigned_abs(),
        })
    }

    pub fn page(&self) -> u64 {
        self.page
    }

    pub fn page_size(&self) -> u64 {
        self.page_size
    }

    /// Saturates, so a far-out page still lands past the last row.
    pub fn offset(&self) -> u64 {
        (self.page - 1).saturating_mul(self.page_size)
    }

    pub fn limit(&self) -> u64 {
        self.page_size
    }
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            page: u64::from(DEFAULT_PAGE),
            page_size: u64::from(DEFAULT_PAGE_SIZE),
        }
    }
}

/// `ceil(total / page_size)`; zero items means zero pages.
pub fn total_pages(total_count: u64, page_size: u64) -> u64 {
    total_count.div_ceil(page_size.max(1))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PagedResult<T> {
    pub total_count: u64,
    pub page: u64,
    pub page_size: u64,
    pub total_pages: u64,
    pub items: Vec<T>,
}

impl<T> PagedResult<T> {
    pub fn new(request: PageRequest, total_count: u64, items: Vec<T>) -> Self {
        Self {
            total_count,
            page: request.page(),
            page_size: request.page_size(),
            total_pages: total_pages(total_count, request.page_size()),
            items,
        }
    }
}
