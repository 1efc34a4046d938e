//! Read-side query service and the axum JSON API for the cat catalog.

use std::sync::Arc;

use axum::{
    extract::{
        rejection::{PathRejection, QueryRejection},
        Path, Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use stc_core::{ImageWithTags, PageRequest, PagedResult, DEFAULT_PAGE, DEFAULT_PAGE_SIZE};
use stc_storage::{CatalogStore, ImageFilter};
use stc_sync::{CatalogError, SyncPipeline};
use tokio::net::TcpListener;
use tracing::{debug, error, info};

pub const CRATE_NAME: &str = "stc-web";

/// Paginated and filtered reads over the store. Never mutates.
#[derive(Clone)]
pub struct QueryService {
    store: Arc<dyn CatalogStore>,
}

impl QueryService {
    pub fn new(store: Arc<dyn CatalogStore>) -> Self {
        Self { store }
    }

    pub async fn get_by_id(&self, id: i64) -> Result<ImageWithTags, CatalogError> {
        self.store
            .get_image_with_tags(id)
            .await?
            .ok_or_else(|| CatalogError::NotFound(format!("image {id}")))
    }

    pub async fn list_paged(
        &self,
        page: i64,
        page_size: i64,
    ) -> Result<PagedResult<ImageWithTags>, CatalogError> {
        let request = PageRequest::new(page, page_size).map_err(CatalogError::InvalidArgument)?;
        self.page(ImageFilter::All, request).await
    }

    /// The tag name must match exactly, including case.
    pub async fn list_by_tag(
        &self,
        tag_name: &str,
        page: i64,
        page_size: i64,
    ) -> Result<PagedResult<ImageWithTags>, CatalogError> {
        let request = PageRequest::new(page, page_size).map_err(CatalogError::InvalidArgument)?;
        let tag = self
            .store
            .find_tag_by_name(tag_name)
            .await?
            .ok_or_else(|| CatalogError::NotFound(format!("tag {tag_name}")))?;
        self.page(ImageFilter::Tagged(tag.id), request).await
    }

    async fn page(
        &self,
        filter: ImageFilter,
        request: PageRequest,
    ) -> Result<PagedResult<ImageWithTags>, CatalogError> {
        let total_count = self.store.count_matching(filter).await?;
        let items = self
            .store
            .page_images(filter, request.offset(), request.limit())
            .await?;
        debug!(?filter, total_count, returned = items.len(), "page served");
        Ok(PagedResult::new(request, total_count, items))
    }
}

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<SyncPipeline>,
    pub queries: QueryService,
}

impl AppState {
    pub fn new(pipeline: SyncPipeline) -> Self {
        let queries = QueryService::new(pipeline.store());
        Self {
            pipeline: Arc::new(pipeline),
            queries,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TagView {
    pub tag_id: i64,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatView {
    pub id: i64,
    pub cat_id: String,
    pub width: i32,
    pub height: i32,
    pub image: String,
    pub created: DateTime<Utc>,
    pub tags: Vec<TagView>,
}

impl From<ImageWithTags> for CatView {
    fn from(value: ImageWithTags) -> Self {
        Self {
            id: value.image.id,
            cat_id: value.image.external_id,
            width: value.image.width,
            height: value.image.height,
            image: value.image.url,
            created: value.image.created_at,
            tags: value
                .tags
                .into_iter()
                .map(|t| TagView {
                    tag_id: t.tag_id,
                    name: t.name,
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatPage {
    pub total_count: u64,
    pub page: u64,
    pub page_size: u64,
    pub total_pages: u64,
    pub cats: Vec<CatView>,
}

impl From<PagedResult<ImageWithTags>> for CatPage {
    fn from(value: PagedResult<ImageWithTags>) -> Self {
        Self {
            total_count: value.total_count,
            page: value.page,
            page_size: value.page_size,
            total_pages: value.total_pages,
            cats: value.items.into_iter().map(CatView::from).collect(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PageQuery {
    page: Option<i64>,
    page_size: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TagPageQuery {
    tag: String,
    page: Option<i64>,
    page_size: Option<i64>,
}

/// Maps catalog failures onto HTTP statuses with a `{error, message}` body.
pub struct ApiError(CatalogError);

impl From<CatalogError> for ApiError {
    fn from(value: CatalogError) -> Self {
        Self(value)
    }
}

/// Malformed paths and query strings are argument errors, not axum's plain-text 400.
impl From<PathRejection> for ApiError {
    fn from(value: PathRejection) -> Self {
        Self(CatalogError::InvalidArgument(value.body_text()))
    }
}

impl From<QueryRejection> for ApiError {
    fn from(value: QueryRejection) -> Self {
        Self(CatalogError::InvalidArgument(value.body_text()))
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            CatalogError::InvalidArgument(_)
            | CatalogError::CapacityReached { .. }
            | CatalogError::NothingToLink => StatusCode::BAD_REQUEST,
            CatalogError::NotFound(_) => StatusCode::NOT_FOUND,
            CatalogError::UpstreamUnavailable(_) => StatusCode::BAD_GATEWAY,
            CatalogError::LinkTransactionFailed(_) | CatalogError::Store(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(kind = self.0.kind(), error = %self.0, "request failed");
        }
        (
            status,
            Json(serde_json::json!({
                "error": self.0.kind(),
                "message": self.0.to_string(),
            })),
        )
            .into_response()
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/cats/fetch-cats", post(fetch_cats_handler))
        .route("/api/cats/fetch-tags", post(fetch_tags_handler))
        .route("/api/cats/link-tags-to-cats", post(link_handler))
        .route("/api/cats/paged", get(paged_handler))
        .route("/api/cats/tag", get(by_tag_handler))
        .route("/api/cats/{id}", get(cat_by_id_handler))
        .with_state(state)
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "serving catalog API");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

pub fn port_from_env() -> u16 {
    std::env::var("STC_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000)
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn fetch_cats_handler(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    let inserted = state.pipeline.ingest_images().await?;
    Ok(Json(serde_json::json!({ "inserted": inserted })))
}

async fn fetch_tags_handler(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    let inserted = state.pipeline.extract_tags().await?;
    Ok(Json(serde_json::json!({ "inserted": inserted })))
}

async fn link_handler(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    let created = state.pipeline.link_all().await?;
    Ok(Json(serde_json::json!({ "created": created })))
}

async fn cat_by_id_handler(
    State(state): State<AppState>,
    id: Result<Path<i64>, PathRejection>,
) -> Result<Json<CatView>, ApiError> {
    let Path(id) = id?;
    let cat = state.queries.get_by_id(id).await?;
    Ok(Json(cat.into()))
}

async fn paged_handler(
    State(state): State<AppState>,
    query: Result<Query<PageQuery>, QueryRejection>,
) -> Result<Json<CatPage>, ApiError> {
    let Query(query) = query?;
    let page = state
        .queries
        .list_paged(
            query.page.unwrap_or(i64::from(DEFAULT_PAGE)),
            query.page_size.unwrap_or(i64::from(DEFAULT_PAGE_SIZE)),
        )
        .await?;
    Ok(Json(page.into()))
}

async fn by_tag_handler(
    State(state): State<AppState>,
    query: Result<Query<TagPageQuery>, QueryRejection>,
) -> Result<Json<CatPage>, ApiError> {
    let Query(query) = query?;
    let page = state
        .queries
        .list_by_tag(
            &query.tag,
            query.page.unwrap_or(i64::from(DEFAULT_PAGE)),
            query.page_size.unwrap_or(i64::from(DEFAULT_PAGE_SIZE)),
        )
        .await?;
    Ok(Json(page.into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use http_body_util::BodyExt;
    use stc_adapters::StaticSource;
    use stc_core::{BreedRecord, CatImageRecord};
    use stc_storage::MemoryCatalogStore;
    use stc_sync::SyncConfig;
    use tower::ServiceExt;

    fn source() -> StaticSource {
        let images = (0..25)
            .map(|i| CatImageRecord {
                external_id: format!("cat{i:02}"),
                width: 640,
                height: 480,
                url: format!("https://cdn2.thecatapi.com/images/cat{i:02}.jpg"),
            })
            .collect();
        let breeds = vec![
            BreedRecord {
                name: "Ragdoll".into(),
                temperament: Some("Calm, Playful".into()),
            },
            BreedRecord {
                name: "Persian".into(),
                temperament: Some("calm, Loyal".into()),
            },
        ];
        StaticSource::new(images, breeds)
    }

    fn state() -> AppState {
        AppState::new(SyncPipeline::new(
            SyncConfig::default(),
            Arc::new(MemoryCatalogStore::new()),
            Arc::new(source()),
        ))
    }

    async fn seeded_state() -> AppState {
        let state = state();
        state.pipeline.run_once().await.expect("seed");
        state
    }

    async fn call(app: Router, method: &str, uri: &str) -> (StatusCode, serde_json::Value) {
        let resp = app
            .oneshot(
                axum::http::Request::builder()
                    .method(method)
                    .uri(uri)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn paged_listing_reports_totals() {
        let state = seeded_state().await;
        let page = state.queries.list_paged(3, 10).await.unwrap();
        assert_eq!(page.items.len(), 5);
        assert_eq!(page.total_pages, 3);
        assert_eq!(page.total_count, 25);
        assert_eq!(page.items[0].image.id, 21);
        assert_eq!(page.items[0].tags.len(), 3);

        let beyond = state.queries.list_paged(7, 10).await.unwrap();
        assert!(beyond.items.is_empty());
        assert_eq!(beyond.total_pages, 3);
        assert_eq!(beyond.total_count, 25);
    }

    #[tokio::test]
    async fn invalid_bounds_are_rejected() {
        let state = seeded_state().await;
        assert!(matches!(
            state.queries.list_paged(0, 10).await.unwrap_err(),
            CatalogError::InvalidArgument(_)
        ));
        assert!(matches!(
            state.queries.list_by_tag("Calm", 1, 0).await.unwrap_err(),
            CatalogError::InvalidArgument(_)
        ));
    }

    #[tokio::test]
    async fn tag_filter_is_exact_and_case_sensitive() {
        let state = seeded_state().await;
        let page = state.queries.list_by_tag("Playful", 1, 10).await.unwrap();
        assert_eq!(page.total_count, 25);
        assert_eq!(page.items.len(), 10);
        assert!(page
            .items
            .iter()
            .all(|i| i.tags.iter().any(|t| t.name == "Playful")));

        assert!(matches!(
            state.queries.list_by_tag("playful", 1, 10).await.unwrap_err(),
            CatalogError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn missing_image_is_not_found() {
        let state = seeded_state().await;
        assert!(matches!(
            state.queries.get_by_id(999).await.unwrap_err(),
            CatalogError::NotFound(_)
        ));
        let found = state.queries.get_by_id(1).await.unwrap();
        assert_eq!(found.image.external_id, "cat00");
    }

    #[tokio::test]
    async fn handler_smoke_ingest_link_and_read() {
        let app = app(state());

        let (status, body) = call(app.clone(), "GET", "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");

        let (status, body) = call(app.clone(), "POST", "/api/cats/link-tags-to-cats").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "NothingToLink");

        let (status, body) = call(app.clone(), "POST", "/api/cats/fetch-cats").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["inserted"], 25);

        let (status, body) = call(app.clone(), "POST", "/api/cats/fetch-cats").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "CapacityReached");

        let (_, body) = call(app.clone(), "POST", "/api/cats/fetch-tags").await;
        assert_eq!(body["inserted"], 3);

        let (_, body) = call(app.clone(), "POST", "/api/cats/link-tags-to-cats").await;
        assert_eq!(body["created"], 75);

        let (status, body) = call(app.clone(), "GET", "/api/cats/paged?page=3&pageSize=10").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["totalCount"], 25);
        assert_eq!(body["totalPages"], 3);
        assert_eq!(body["cats"].as_array().unwrap().len(), 5);
        assert_eq!(body["cats"][0]["catId"], "cat20");
        assert!(body["cats"][0]["tags"][0]["tagId"].is_number());

        let (status, body) = call(app.clone(), "GET", "/api/cats/tag?tag=Loyal").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["pageSize"], 10);
        assert_eq!(body["cats"].as_array().unwrap().len(), 10);

        let (status, _) = call(app.clone(), "GET", "/api/cats/tag?tag=Grumpy").await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) = call(app.clone(), "GET", "/api/cats/paged?page=0").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "InvalidArgument");

        let (status, body) = call(app.clone(), "GET", "/api/cats/1").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["image"], "https://cdn2.thecatapi.com/images/cat00.jpg");

        let (status, body) = call(app, "GET", "/api/cats/404").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "NotFound");
    }

    #[tokio::test]
    async fn malformed_requests_get_json_argument_errors() {
        let app = app(seeded_state().await);
        for uri in [
            "/api/cats/paged?page=abc",
            "/api/cats/paged?pageSize=1.5",
            "/api/cats/tag",
            "/api/cats/tag?tag=Calm&page=x",
            "/api/cats/abc",
        ] {
            let (status, body) = call(app.clone(), "GET", uri).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "{uri}");
            assert_eq!(body["error"], "InvalidArgument", "{uri}");
            assert!(body["message"].as_str().is_some_and(|m| !m.is_empty()), "{uri}");
        }
    }

    #[tokio::test]
    async fn far_out_pages_are_empty_not_errors() {
        let state = seeded_state().await;
        let page = state.queries.list_paged(5_000_000_000, 10).await.unwrap();
        assert!(page.items.is_empty());
        assert_eq!(page.total_count, 25);
        assert_eq!(page.total_pages, 3);

        let (status, body) = call(app(state), "GET", "/api/cats/paged?page=5000000000").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["page"], 5_000_000_000u64);
        assert!(body["cats"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn upstream_outage_maps_to_bad_gateway() {
        let state = AppState::new(SyncPipeline::new(
            SyncConfig::default(),
            Arc::new(MemoryCatalogStore::new()),
            Arc::new(StaticSource::unavailable()),
        ));
        let (status, body) = call(app(state), "POST", "/api/cats/fetch-tags").await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(body["error"], "UpstreamUnavailable");
    }
}
