//! External image/breed source contracts and implementations.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use stc_core::{BreedRecord, CatImageRecord};
use thiserror::Error;
use tokio::fs;
use tracing::debug;

pub mod http;

pub use http::{FetchError, FetchedResponse, HttpClientConfig, HttpFetcher};

pub const CRATE_NAME: &str = "stc-adapters";

pub const DEFAULT_CAT_API_BASE_URL: &str = "https://api.thecatapi.com";

pub const IMAGES_FIXTURE: &str = "images.json";
pub const BREEDS_FIXTURE: &str = "breeds.json";

#[derive(Debug, Error)]
pub enum SourceError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("decoding {what}: {source}")]
    Decode {
        what: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{0}")]
    Unavailable(String),
}

/// Read-only provider of image and breed records.
#[async_trait]
pub trait CatSource: Send + Sync {
    fn source_id(&self) -> &'static str;

    async fn fetch_images(&self, limit: usize) -> Result<Vec<CatImageRecord>, SourceError>;

    async fn fetch_breeds(&self) -> Result<Vec<BreedRecord>, SourceError>;
}

/// Image payload in TheCatAPI's `/v1/images/search` shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiImage {
    pub id: String,
    pub width: i32,
    pub height: i32,
    pub url: String,
}

impl From<ApiImage> for CatImageRecord {
    fn from(value: ApiImage) -> Self {
        Self {
            external_id: value.id,
            width: value.width,
            height: value.height,
            url: value.url,
        }
    }
}

/// Breed payload in TheCatAPI's `/v1/breeds` shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiBreed {
    pub name: String,
    #[serde(default)]
    pub temperament: Option<String>,
}

impl From<ApiBreed> for BreedRecord {
    fn from(value: ApiBreed) -> Self {
        Self {
            name: value.name,
            temperament: value.temperament,
        }
    }
}

pub fn decode_images(bytes: &[u8]) -> Result<Vec<CatImageRecord>, SourceError> {
    let images: Vec<ApiImage> = decode(bytes, "image list")?;
    Ok(images.into_iter().map(Into::into).collect())
}

pub fn decode_breeds(bytes: &[u8]) -> Result<Vec<BreedRecord>, SourceError> {
    let breeds: Vec<ApiBreed> = decode(bytes, "breed list")?;
    Ok(breeds.into_iter().map(Into::into).collect())
}

/// A `null` body decodes as an empty list.
fn decode<T: DeserializeOwned>(bytes: &[u8], what: &str) -> Result<Vec<T>, SourceError> {
    let value: Option<Vec<T>> =
        serde_json::from_slice(bytes).map_err(|source| SourceError::Decode {
            what: what.to_string(),
            source,
        })?;
    Ok(value.unwrap_or_default())
}

/// Live adapter for TheCatAPI.
#[derive(Debug)]
pub struct CatApiSource {
    base_url: String,
    http: HttpFetcher,
}

impl CatApiSource {
    pub fn new(base_url: impl Into<String>, http: HttpFetcher) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http,
        }
    }

    pub fn images_url(&self, limit: usize) -> String {
        format!("{}/v1/images/search?limit={limit}", self.base_url)
    }

    pub fn breeds_url(&self) -> String {
        format!("{}/v1/breeds", self.base_url)
    }
}

#[async_trait]
impl CatSource for CatApiSource {
    fn source_id(&self) -> &'static str {
        "thecatapi"
    }

    async fn fetch_images(&self, limit: usize) -> Result<Vec<CatImageRecord>, SourceError> {
        let resp = self.http.fetch_bytes(&self.images_url(limit)).await?;
        debug!(bytes = resp.body.len(), url = %resp.final_url, "fetched image batch");
        decode_images(&resp.body)
    }

    async fn fetch_breeds(&self) -> Result<Vec<BreedRecord>, SourceError> {
        let resp = self.http.fetch_bytes(&self.breeds_url()).await?;
        debug!(bytes = resp.body.len(), url = %resp.final_url, "fetched breeds");
        decode_breeds(&resp.body)
    }
}

/// Reads `images.json` and `breeds.json` (TheCatAPI wire format) from a directory.
#[derive(Debug, Clone)]
pub struct FixtureSource {
    dir: PathBuf,
}

impl FixtureSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    async fn read(&self, file: &str) -> Result<Vec<u8>, SourceError> {
        let path = self.dir.join(file);
        fs::read(&path)
            .await
            .map_err(|source| SourceError::Io { path, source })
    }
}

#[async_trait]
impl CatSource for FixtureSource {
    fn source_id(&self) -> &'static str {
        "fixture"
    }

    async fn fetch_images(&self, limit: usize) -> Result<Vec<CatImageRecord>, SourceError> {
        let mut images = decode_images(&self.read(IMAGES_FIXTURE).await?)?;
        images.truncate(limit);
        Ok(images)
    }

    async fn fetch_breeds(&self) -> Result<Vec<BreedRecord>, SourceError> {
        decode_breeds(&self.read(BREEDS_FIXTURE).await?)
    }
}

/// In-memory records, handy for tests and demos.
#[derive(Debug, Clone, Default)]
pub struct StaticSource {
    pub images: Vec<CatImageRecord>,
    pub breeds: Vec<BreedRecord>,
    pub unavailable: bool,
}

impl StaticSource {
    pub fn new(images: Vec<CatImageRecord>, breeds: Vec<BreedRecord>) -> Self {
        Self {
            images,
            breeds,
            unavailable: false,
        }
    }

    /// A source whose every fetch fails.
    pub fn unavailable() -> Self {
        Self {
            unavailable: true,
            ..Default::default()
        }
    }
}

#[async_trait]
impl CatSource for StaticSource {
    fn source_id(&self) -> &'static str {
        "static"
    }

    async fn fetch_images(&self, limit: usize) -> Result<Vec<CatImageRecord>, SourceError> {
        if self.unavailable {
            return Err(SourceError::Unavailable("static source offline".into()));
        }
        Ok(self.images.iter().take(limit).cloned().collect())
    }

    async fn fetch_breeds(&self) -> Result<Vec<BreedRecord>, SourceError> {
        if self.unavailable {
            return Err(SourceError::Unavailable("static source offline".into()));
        }
        Ok(self.breeds.clone())
    }
}
