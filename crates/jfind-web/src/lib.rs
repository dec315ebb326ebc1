//! Axum + Askama results viewer for job search runs.

use std::path::PathBuf;
use std::sync::Arc;

use askama::Template;
use axum::{
    extract::{Path as AxumPath, Query, State},
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::get,
    Json, Router,
};
use jfind_core::ScoredListing;
use jfind_storage::JobStore;
use jfind_sync::{list_run_reports, SearchConfig};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "jfind-web";

#[derive(Clone)]
pub struct AppState {
    pub workspace_root: PathBuf,
    pub store: Option<JobStore>,
}

impl AppState {
    pub fn new(workspace_root: impl Into<PathBuf>) -> Self {
        Self {
            workspace_root: workspace_root.into(),
            store: None,
        }
    }

    pub fn with_store(mut self, store: JobStore) -> Self {
        self.store = Some(store);
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WebListing {
    pub id: String,
    pub page: u32,
    pub title: String,
    pub link: String,
    pub description: String,
    pub has_description: bool,
    pub found_skills: String,
    pub matching_percentage: f64,
}

impl WebListing {
    fn from_scored(id: String, listing: &ScoredListing) -> Self {
        Self {
            id,
            page: listing.page,
            title: listing.record.title.clone(),
            link: listing.record.link.clone(),
            description: listing.record.description.clone(),
            has_description: listing.record.has_description(),
            found_skills: listing.found_skills_text(),
            matching_percentage: listing.matching_percentage,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunView {
    pub run_id: String,
    pub query: String,
    pub listings: Vec<WebListing>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummaryRow {
    pub run_id: String,
    pub query: String,
    pub listings: usize,
    pub created_at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortKey {
    #[default]
    Score,
    Title,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

impl SortOrder {
    fn as_str(self) -> &'static str {
        match self {
            Self::Asc => "asc",
            Self::Desc => "desc",
        }
    }

    fn flipped(self) -> Self {
        match self {
            Self::Asc => Self::Desc,
            Self::Desc => Self::Asc,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct ListingsQuery {
    run: Option<Uuid>,
    #[serde(default)]
    sort: SortKey,
    #[serde(default)]
    order: SortOrder,
}

#[derive(Debug, Deserialize, Default)]
struct DetailQuery {
    run: Option<Uuid>,
}

#[derive(Template)]
#[template(path = "index.html")]
struct IndexTemplate {
    run_id: String,
    query: String,
    listings: Vec<WebListing>,
    score_sort_href: String,
    title_sort_href: String,
    sort_label: String,
}

#[derive(Template)]
#[template(path = "listing_detail.html")]
struct ListingDetailTemplate {
    run_id: String,
    listing: WebListing,
}

#[derive(Template)]
#[template(path = "runs.html")]
struct RunsTemplate {
    runs: Vec<RunSummaryRow>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/listings/{id}", get(listing_detail_handler))
        .route("/runs", get(runs_handler))
        .route("/api/listings", get(listings_json_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let port: u16 = std::env::var("JFIND_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    let config = SearchConfig::from_env();
    let mut state = AppState::new(config.workspace_root.clone());
    match JobStore::connect(&config.database_url).await {
        Ok(store) => state = state.with_store(store),
        Err(err) => warn!(error = %err, "job store unavailable; serving run reports only"),
    }
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "serving results");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn index_handler(State(state): State<Arc<AppState>>, Query(query): Query<ListingsQuery>) -> Response {
    match load_run_view(&state, query.run).await {
        Ok(view) => {
            let view = view.unwrap_or_else(empty_view);
            let run_param = if view.run_id.is_empty() {
                String::new()
            } else {
                format!("&run={}", view.run_id)
            };
            let next_order = |key: SortKey| {
                if query.sort == key {
                    query.order.flipped()
                } else {
                    SortOrder::default()
                }
            };
            let score_sort_href = format!("/?sort=score&order={}{run_param}", next_order(SortKey::Score).as_str());
            let title_sort_href = format!("/?sort=title&order={}{run_param}", next_order(SortKey::Title).as_str());
            let sort_label = format!(
                "{} {}",
                match query.sort {
                    SortKey::Score => "score",
                    SortKey::Title => "title",
                },
                query.order.as_str()
            );
            let mut listings = view.listings;
            sort_listings(&mut listings, query.sort, query.order);
            render_html(IndexTemplate {
                run_id: view.run_id,
                query: view.query,
                listings,
                score_sort_href,
                title_sort_href,
                sort_label,
            })
        }
        Err(err) => server_error(err),
    }
}

async fn listing_detail_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
    Query(query): Query<DetailQuery>,
) -> Response {
    match load_run_view(&state, query.run).await {
        Ok(Some(view)) => match view.listings.into_iter().find(|l| l.id == id) {
            Some(listing) => render_html(ListingDetailTemplate {
                run_id: view.run_id,
                listing,
            }),
            None => not_found("Listing not found"),
        },
        Ok(None) => not_found("No runs recorded yet"),
        Err(err) => server_error(err),
    }
}

async fn runs_handler(State(state): State<Arc<AppState>>) -> Response {
    match load_runs(&state, 20).await {
        Ok(runs) => render_html(RunsTemplate { runs }),
        Err(err) => server_error(err),
    }
}

async fn listings_json_handler(State(state): State<Arc<AppState>>, Query(query): Query<ListingsQuery>) -> Response {
    match load_run_view(&state, query.run).await {
        Ok(view) => {
            let mut view = view.unwrap_or_else(empty_view);
            sort_listings(&mut view.listings, query.sort, query.order);
            Json(view).into_response()
        }
        Err(err) => server_error(err),
    }
}

fn render_html<T: Template>(tpl: T) -> Response {
    match tpl.render() {
        Ok(html) => Html(html).into_response(),
        Err(err) => server_error(anyhow::anyhow!(err.to_string())),
    }
}

fn server_error(err: anyhow::Error) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Html(format!("Server error: {}", err)),
    )
        .into_response()
}

fn not_found(message: &str) -> Response {
    (StatusCode::NOT_FOUND, Html(message.to_string())).into_response()
}

fn empty_view() -> RunView {
    RunView {
        run_id: String::new(),
        query: String::new(),
        listings: Vec::new(),
    }
}

/// Ties keep extraction order.
pub fn sort_listings(listings: &mut [WebListing], key: SortKey, order: SortOrder) {
    listings.sort_by(|a, b| {
        let ord = match key {
            SortKey::Score => a.matching_percentage.total_cmp(&b.matching_percentage),
            SortKey::Title => a.title.to_lowercase().cmp(&b.title.to_lowercase()),
        };
        match order {
            SortOrder::Asc => ord,
            SortOrder::Desc => ord.reverse(),
        }
    });
}

/// Listings of `run` (or the latest run) from the job store, falling back to report files.
async fn load_run_view(state: &AppState, run: Option<Uuid>) -> anyhow::Result<Option<RunView>> {
    if let Some(store) = &state.store {
        match load_run_view_from_store(store, run).await {
            Ok(Some(view)) if !view.listings.is_empty() => return Ok(Some(view)),
            Ok(_) => {}
            Err(err) => warn!(error = %err, "job store read failed; using run reports"),
        }
    }
    load_run_view_from_reports(state, run)
}

async fn load_run_view_from_store(store: &JobStore, run: Option<Uuid>) -> anyhow::Result<Option<RunView>> {
    let run_id = match run {
        Some(run_id) => run_id,
        None => match store.latest_run_id().await? {
            Some(run_id) => run_id,
            None => return Ok(None),
        },
    };
    let jobs = store.list_run(run_id).await?;
    let Some(first) = jobs.first() else { return Ok(None) };
    let query = first.query.clone();
    let listings = jobs
        .iter()
        .map(|job| WebListing::from_scored(job.id.to_string(), &job.listing))
        .collect();
    Ok(Some(RunView {
        run_id: run_id.to_string(),
        query,
        listings,
    }))
}

fn load_run_view_from_reports(state: &AppState, run: Option<Uuid>) -> anyhow::Result<Option<RunView>> {
    let reports = list_run_reports(&state.workspace_root, usize::MAX)?;
    let report = match run {
        Some(run_id) => reports.into_iter().find(|r| r.meta.run_id == run_id),
        None => reports.into_iter().next(),
    };
    Ok(report.map(|report| RunView {
        run_id: report.meta.run_id.to_string(),
        query: report.meta.query.clone(),
        listings: report
            .listings
            .iter()
            .enumerate()
            .map(|(idx, listing)| WebListing::from_scored(idx.to_string(), listing))
            .collect(),
    }))
}

async fn load_runs(state: &AppState, limit: usize) -> anyhow::Result<Vec<RunSummaryRow>> {
    if let Some(store) = &state.store {
        match store.recent_runs(limit).await {
            Ok(rows) if !rows.is_empty() => {
                return Ok(rows
                    .into_iter()
                    .map(|r| RunSummaryRow {
                        run_id: r.run_id.to_string(),
                        query: r.query,
                        listings: r.listings,
                        created_at: r.created_at.format("%Y-%m-%d %H:%M").to_string(),
                    })
                    .collect())
            }
            Ok(_) => {}
            Err(err) => warn!(error = %err, "job store read failed; using run reports"),
        }
    }
    Ok(list_run_reports(&state.workspace_root, limit)?
        .into_iter()
        .map(|r| RunSummaryRow {
            run_id: r.meta.run_id.to_string(),
            query: r.meta.query,
            listings: r.listings.len(),
            created_at: r.meta.started_at.format("%Y-%m-%d %H:%M").to_string(),
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{header, Request};
    use chrono::Utc;
    use http_body_util::BodyExt;
    use jfind_core::{ListingRecord, PageRange, RunMeta, DESCRIPTION_UNAVAILABLE};
    use jfind_sync::RunReport;
    use std::collections::BTreeSet;
    use tower::ServiceExt;

    fn scored(title: &str, link: &str, description: &str, skills: &[&str], pct: f64) -> ScoredListing {
        ScoredListing::new(
            1,
            ListingRecord::new(title, link, description),
            skills.iter().map(|s| s.to_string()).collect::<BTreeSet<_>>(),
            pct,
        )
    }

    fn seeded_workspace() -> (tempfile::TempDir, Uuid) {
        let dir = tempfile::tempdir().unwrap();
        let meta = RunMeta::new("rust", PageRange::new(1, 1).unwrap());
        let report = RunReport {
            meta: meta.clone(),
            finished_at: Utc::now(),
            pages_completed: vec![1],
            failure: None,
            skipped: Vec::new(),
            degraded: Vec::new(),
            listings: vec![
                scored("Backend <Go>", "https://hh.ru/vacancy/1", "Go & SQL services", &["sql"], 12.5),
                scored("Analyst", "https://hh.ru/vacancy/2", DESCRIPTION_UNAVAILABLE, &[], 0.0),
                scored("Rust Engineer", "https://hh.ru/vacancy/3", "Rust and Tokio", &["rust"], 61.257),
            ],
        };
        let run_dir = dir.path().join("reports").join(meta.run_id.to_string());
        std::fs::create_dir_all(&run_dir).unwrap();
        std::fs::write(run_dir.join("results.json"), serde_json::to_vec(&report).unwrap()).unwrap();
        (dir, meta.run_id)
    }

    async fn get_text(app: Router, uri: &str) -> (StatusCode, String) {
        let resp = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn handler_smoke_index_sorted_by_score() {
        let (dir, _) = seeded_workspace();
        let (status, text) = get_text(app(AppState::new(dir.path())), "/").await;
        assert_eq!(status, StatusCode::OK);
        assert!(text.contains("61.26"));
        assert!(text.contains("12.50"));
        let rust = text.find("Rust Engineer").unwrap();
        let go = text.find("Backend &lt;Go&gt;").unwrap();
        let analyst = text.find("Analyst").unwrap();
        assert!(rust < go && go < analyst);
        assert!(text.contains(r#"target="_blank""#));
    }

    #[tokio::test]
    async fn handler_smoke_index_sorted_by_title() {
        let (dir, _) = seeded_workspace();
        let (status, text) = get_text(app(AppState::new(dir.path())), "/?sort=title&order=asc").await;
        assert_eq!(status, StatusCode::OK);
        let analyst = text.find("Analyst").unwrap();
        let go = text.find("Backend &lt;Go&gt;").unwrap();
        let rust = text.find("Rust Engineer").unwrap();
        assert!(analyst < go && go < rust);
    }

    #[tokio::test]
    async fn handler_smoke_listing_detail() {
        let (dir, run_id) = seeded_workspace();
        let app = app(AppState::new(dir.path()));
        let (status, text) = get_text(app.clone(), &format!("/listings/0?run={run_id}")).await;
        assert_eq!(status, StatusCode::OK);
        assert!(text.contains("Go &amp; SQL services"));
        assert!(text.contains("Open Link"));

        let (status, _) = get_text(app, "/listings/99").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn handler_smoke_listings_json() {
        let (dir, run_id) = seeded_workspace();
        let resp = app(AppState::new(dir.path()))
            .oneshot(Request::builder().uri("/api/listings?sort=score&order=asc").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()[header::CONTENT_TYPE].to_str().unwrap(), "application/json");
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["run_id"], run_id.to_string());
        assert_eq!(value["listings"][0]["title"], "Analyst");
        assert_eq!(value["listings"][0]["has_description"], false);
        assert_eq!(value["listings"][2]["title"], "Rust Engineer");
    }

    #[tokio::test]
    async fn handler_smoke_empty_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(AppState::new(dir.path()));
        let (status, text) = get_text(app.clone(), "/").await;
        assert_eq!(status, StatusCode::OK);
        assert!(text.contains("No results yet"));
        let (status, _) = get_text(app, "/runs").await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn store_results_take_precedence_over_reports() {
        let (dir, _) = seeded_workspace();
        let url = format!("sqlite://{}", dir.path().join("jobs.db").display());
        let store = JobStore::connect(&url).await.unwrap();
        let meta = RunMeta::new("python", PageRange::new(1, 1).unwrap());
        store
            .append_run(
                &meta,
                &[scored("Python Dev", "https://hh.ru/vacancy/9", "python", &["python"], 100.0)],
            )
            .await
            .unwrap();

        let app = app(AppState::new(dir.path()).with_store(store));
        let (_, text) = get_text(app.clone(), "/").await;
        assert!(text.contains("Python Dev"));
        assert!(!text.contains("Rust Engineer"));

        let (_, runs) = get_text(app, "/runs").await;
        assert!(runs.contains(&meta.run_id.to_string()));
    }

    #[tokio::test]
    async fn older_run_is_served_when_many_runs_follow_it() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("jobs.db").display());
        let store = JobStore::connect(&url).await.unwrap();
        let oldest = RunMeta::new("haskell", PageRange::new(1, 1).unwrap());
        store
            .append_run(
                &oldest,
                &[scored("Haskell Dev", "https://hh.ru/vacancy/500", "haskell", &["haskell"], 80.0)],
            )
            .await
            .unwrap();
        for n in 0..60 {
            let meta = RunMeta::new("rust", PageRange::new(1, 1).unwrap());
            let link = format!("https://hh.ru/vacancy/{n}");
            store
                .append_run(&meta, &[scored("Rust Dev", &link, "rust", &["rust"], 50.0)])
                .await
                .unwrap();
        }

        let app = app(AppState::new(dir.path()).with_store(store));
        let (status, text) = get_text(app, &format!("/api/listings?run={}", oldest.run_id)).await;
        assert_eq!(status, StatusCode::OK);
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["run_id"], oldest.run_id.to_string());
        assert_eq!(value["query"], "haskell");
        assert_eq!(value["listings"][0]["title"], "Haskell Dev");
    }
}
