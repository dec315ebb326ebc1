//! Search run orchestration: page loop, scoring, persistence and run reports.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use arrow_array::{BooleanArray, Float64Array, RecordBatch, StringArray, UInt32Array};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::{DateTime, Utc};
use jfind_adapters::{
    Extractor, HttpNavigator, HttpSource, ListingIssue, Navigator, NavigatorError, PageNavigator, SiteProfile,
};
use jfind_core::{PageRange, RunMeta, ScoredListing, SkillProfile};
use jfind_scoring::RelevanceScorer;
use jfind_storage::{ArtifactStore, BackoffPolicy, HttpClientConfig, HttpFetcher, JobStore, TokenBucketConfig};
use parquet::arrow::ArrowWriter;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tracing::{info, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "jfind-sync";

#[derive(Debug, Clone)]
pub struct SearchConfig {
    pub database_url: String,
    pub artifacts_dir: PathBuf,
    pub archive_pages: bool,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub wait_timeout: Duration,
    pub session_cookie: Option<String>,
    pub requests_per_sec: Option<f64>,
    pub site_profile_path: PathBuf,
    pub workspace_root: PathBuf,
}

fn env_flag(value: &str) -> bool {
    matches!(value, "1" | "true" | "TRUE" | "True" | "yes")
}

impl SearchConfig {
    pub fn from_env() -> Self {
        Self {
            database_url: std::env::var("JFIND_DATABASE_URL").unwrap_or_else(|_| "sqlite:jobs.db".to_string()),
            artifacts_dir: std::env::var("JFIND_ARTIFACTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./artifacts")),
            archive_pages: std::env::var("JFIND_ARCHIVE_PAGES")
                .map(|v| env_flag(&v))
                .unwrap_or(false),
            user_agent: std::env::var("JFIND_USER_AGENT").unwrap_or_else(|_| {
                "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) jfind/0.1".to_string()
            }),
            http_timeout_secs: std::env::var("JFIND_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            wait_timeout: Duration::from_secs(
                std::env::var("JFIND_WAIT_TIMEOUT_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(20),
            ),
            session_cookie: std::env::var("JFIND_SESSION_COOKIE").ok().filter(|v| !v.trim().is_empty()),
            requests_per_sec: std::env::var("JFIND_REQUESTS_PER_SEC")
                .ok()
                .and_then(|v| v.parse().ok()),
            site_profile_path: std::env::var("JFIND_SITE_PROFILE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("site.yaml")),
            workspace_root: PathBuf::from("."),
        }
    }

    /// Poll schedule for element waits: at most two re-fetches, 0.5 s apart.
    pub fn wait_poll_policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            max_retries: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_millis(500),
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            session_cookie: self.session_cookie.clone(),
            token_bucket: self.requests_per_sec.and_then(TokenBucketConfig::per_second),
            ..Default::default()
        }
    }
}

/// Errors that stop a run. Results gathered before the error are kept.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum NavigationFatalError {
    #[error("cannot build the URL for page {page}: {reason}")]
    PageUrl { page: u32, reason: String },
    #[error("page {page} failed to load: {source}")]
    PageLoad {
        page: u32,
        #[source]
        source: NavigatorError,
    },
    #[error("page {page} aborted: {source}")]
    PageAborted {
        page: u32,
        #[source]
        source: NavigatorError,
    },
}

impl NavigationFatalError {
    pub fn page(&self) -> u32 {
        match self {
            Self::PageUrl { page, .. } | Self::PageLoad { page, .. } | Self::PageAborted { page, .. } => *page,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SearchOutcome {
    pub meta: RunMeta,
    pub finished_at: DateTime<Utc>,
    /// Pages whose every listing was attempted.
    pub pages_completed: Vec<u32>,
    pub listings: Vec<ScoredListing>,
    pub skipped: Vec<ListingIssue>,
    pub degraded: Vec<ListingIssue>,
    pub failure: Option<NavigationFatalError>,
}

impl SearchOutcome {
    pub fn is_complete(&self) -> bool {
        self.failure.is_none()
    }
}

pub struct SearchPipeline {
    extractor: Extractor,
    scorer: RelevanceScorer,
}

impl SearchPipeline {
    pub fn new(site: SiteProfile, wait_timeout: Duration) -> Self {
        Self {
            extractor: Extractor::new(site, wait_timeout),
            scorer: RelevanceScorer::default(),
        }
    }

    pub fn with_scorer(mut self, scorer: RelevanceScorer) -> Self {
        self.scorer = scorer;
        self
    }

    pub fn site(&self) -> &SiteProfile {
        self.extractor.site()
    }

    /// Visits every page of `range` in order on one navigator session and scores what it extracts.
    ///
    /// Never fails as a whole: a page that cannot be loaded, or whose results
    /// view is lost mid-way, ends the run and is reported in `failure`
    /// alongside everything gathered up to that point.
    pub async fn run_search<N: Navigator + ?Sized>(
        &self,
        nav: &mut N,
        query: &str,
        profile: &SkillProfile,
        range: PageRange,
    ) -> SearchOutcome {
        let meta = RunMeta::new(query, range);
        info!(run_id = %meta.run_id, query, start = range.start(), end = range.end(), skills = profile.skills().len(), "search run started");

        let mut pages_completed = Vec::with_capacity(range.len());
        let mut listings = Vec::new();
        let mut skipped = Vec::new();
        let mut degraded = Vec::new();
        let mut failure = None;

        for page in range.pages() {
            let span = info_span!("results_page", run_id = %meta.run_id, page);

            let url = match self.site().page_url(query, page) {
                Ok(url) => url,
                Err(err) => {
                    failure = Some(NavigationFatalError::PageUrl {
                        page,
                        reason: err.to_string(),
                    });
                    break;
                }
            };

            if let Err(source) = nav.load(url.as_str()).instrument(span.clone()).await {
                warn!(page, %url, error = %source, "results page failed to load; stopping run");
                failure = Some(NavigationFatalError::PageLoad { page, source });
                break;
            }

            let batch = self.extractor.extract_page(nav, page).instrument(span.clone()).await;
            let scored_before = listings.len();
            for record in batch.records {
                let relevance = self.scorer.score(profile, &record.description);
                listings.push(ScoredListing::new(
                    page,
                    record,
                    relevance.found_skills,
                    relevance.matching_percentage,
                ));
            }
            span.in_scope(|| {
                info!(
                    entries = batch.entries,
                    scored = listings.len() - scored_before,
                    skipped = batch.skipped.len(),
                    degraded = batch.degraded.len(),
                    "page done"
                )
            });
            skipped.extend(batch.skipped);
            degraded.extend(batch.degraded);

            if let Some(source) = batch.aborted {
                warn!(page, error = %source, "page aborted; stopping run");
                failure = Some(NavigationFatalError::PageAborted { page, source });
                break;
            }
            pages_completed.push(page);
        }

        let outcome = SearchOutcome {
            meta,
            finished_at: Utc::now(),
            pages_completed,
            listings,
            skipped,
            degraded,
            failure,
        };
        info!(
            run_id = %outcome.meta.run_id,
            listings = outcome.listings.len(),
            pages = outcome.pages_completed.len(),
            complete = outcome.is_complete(),
            "search run finished"
        );
        outcome
    }
}

/// Serialized form of a finished run, written to `reports/<run_id>/results.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub meta: RunMeta,
    pub finished_at: DateTime<Utc>,
    pub pages_completed: Vec<u32>,
    pub failure: Option<String>,
    pub skipped: Vec<ListingIssue>,
    pub degraded: Vec<ListingIssue>,
    pub listings: Vec<ScoredListing>,
}

impl From<&SearchOutcome> for RunReport {
    fn from(outcome: &SearchOutcome) -> Self {
        Self {
            meta: outcome.meta.clone(),
            finished_at: outcome.finished_at,
            pages_completed: outcome.pages_completed.clone(),
            failure: outcome.failure.as_ref().map(ToString::to_string),
            skipped: outcome.skipped.clone(),
            degraded: outcome.degraded.clone(),
            listings: outcome.listings.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ParquetManifest {
    pub schema_version: u32,
    pub files: Vec<ParquetManifestFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ParquetManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

#[derive(Debug, Clone)]
pub struct SearchRunSummary {
    pub outcome: SearchOutcome,
    pub persisted_rows: usize,
    pub reports_dir: PathBuf,
    pub parquet_manifest: PathBuf,
}

/// Writes the outcome to the job store and the run's report directory.
pub async fn persist_outcome(config: &SearchConfig, outcome: SearchOutcome) -> Result<SearchRunSummary> {
    let store = JobStore::connect(&config.database_url).await?;
    let persisted_rows = store
        .append_run(&outcome.meta, &outcome.listings)
        .await
        .context("persisting scored listings")?;

    let reports_dir = write_reports(&config.workspace_root, &outcome).await?;
    let parquet_manifest = export_parquet_snapshot(&reports_dir, &outcome).await?;
    info!(run_id = %outcome.meta.run_id, persisted_rows, reports = %reports_dir.display(), "run persisted");

    Ok(SearchRunSummary {
        outcome,
        persisted_rows,
        reports_dir,
        parquet_manifest,
    })
}

/// Runs a live search against the configured site and persists the result.
pub async fn run_search_from_env(query: &str, skills: &str, range: PageRange) -> Result<SearchRunSummary> {
    run_search_with_config(SearchConfig::from_env(), query, skills, range).await
}

pub async fn run_search_with_config(
    config: SearchConfig,
    query: &str,
    skills: &str,
    range: PageRange,
) -> Result<SearchRunSummary> {
    let site = SiteProfile::load_or_default(&config.site_profile_path)?;
    let profile = SkillProfile::parse(skills);
    if profile.is_empty() {
        warn!("skill list is empty; every listing will score 0");
    }

    let http = Arc::new(HttpFetcher::new(config.http_client_config())?);
    let mut source = HttpSource::new(http);
    if config.archive_pages {
        source = source.with_archive(ArtifactStore::new(config.artifacts_dir.clone()));
    }
    let mut nav: HttpNavigator = PageNavigator::new(source).with_poll_policy(config.wait_poll_policy());

    let pipeline = SearchPipeline::new(site, config.wait_timeout);
    let outcome = pipeline.run_search(&mut nav, query, &profile, range).await;
    persist_outcome(&config, outcome).await
}

fn run_brief_markdown(outcome: &SearchOutcome) -> String {
    let mut ranked = outcome.listings.iter().collect::<Vec<_>>();
    ranked.sort_by(|a, b| b.matching_percentage.total_cmp(&a.matching_percentage));
    let top = ranked
        .iter()
        .take(10)
        .map(|l| {
            format!(
                "- {:.2}% [{}]({}) ({})",
                l.matching_percentage,
                l.record.title,
                l.record.link,
                if l.found_skills.is_empty() {
                    "no skills found".to_string()
                } else {
                    l.found_skills_text()
                }
            )
        })
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        "# Job Finder Run Brief\n\n- Run ID: `{}`\n- Query: {}\n- Pages: {}-{}\n- Started: {}\n- Finished: {}\n- Pages completed: {}\n- Listings: {}\n- Skipped entries: {}\n- Missing descriptions: {}\n- Failure: {}\n\n## Top Matches\n{}\n",
        outcome.meta.run_id,
        outcome.meta.query,
        outcome.meta.range.start(),
        outcome.meta.range.end(),
        outcome.meta.started_at,
        outcome.finished_at,
        outcome.pages_completed.len(),
        outcome.listings.len(),
        outcome.skipped.len(),
        outcome.degraded.len(),
        outcome
            .failure
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_else(|| "none".to_string()),
        top
    )
}

async fn write_reports(workspace_root: &Path, outcome: &SearchOutcome) -> Result<PathBuf> {
    let reports_dir = workspace_root.join("reports").join(outcome.meta.run_id.to_string());
    fs::create_dir_all(&reports_dir)
        .await
        .with_context(|| format!("creating {}", reports_dir.display()))?;

    fs::write(reports_dir.join("run_brief.md"), run_brief_markdown(outcome))
        .await
        .context("writing run_brief.md")?;

    let results = serde_json::to_vec_pretty(&RunReport::from(outcome)).context("serializing run report")?;
    fs::write(reports_dir.join("results.json"), results)
        .await
        .context("writing results.json")?;

    Ok(reports_dir)
}

async fn export_parquet_snapshot(reports_dir: &Path, outcome: &SearchOutcome) -> Result<PathBuf> {
    let snapshot_dir = reports_dir.join("snapshots");
    fs::create_dir_all(&snapshot_dir)
        .await
        .with_context(|| format!("creating {}", snapshot_dir.display()))?;

    let listings_path = snapshot_dir.join("listings.parquet");
    write_listings_parquet(&listings_path, outcome)?;

    let manifest = ParquetManifest {
        schema_version: 1,
        files: vec![manifest_entry("listings", reports_dir, &listings_path)?],
    };
    let manifest_path = snapshot_dir.join("manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing parquet manifest")?;
    fs::write(&manifest_path, bytes)
        .await
        .with_context(|| format!("writing {}", manifest_path.display()))?;
    Ok(manifest_path)
}

fn write_listings_parquet(path: &Path, outcome: &SearchOutcome) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("run_id", DataType::Utf8, false),
        ArrowField::new("page", DataType::UInt32, false),
        ArrowField::new("title", DataType::Utf8, false),
        ArrowField::new("link", DataType::Utf8, false),
        ArrowField::new("has_description", DataType::Boolean, false),
        ArrowField::new("matching_percentage", DataType::Float64, false),
        ArrowField::new("found_skills", DataType::Utf8, false),
    ]));

    let listings = &outcome.listings;
    let run_id = outcome.meta.run_id.to_string();
    let run_ids = StringArray::from(listings.iter().map(|_| Some(run_id.as_str())).collect::<Vec<_>>());
    let pages = UInt32Array::from(listings.iter().map(|l| l.page).collect::<Vec<_>>());
    let titles = StringArray::from(
        listings
            .iter()
            .map(|l| Some(l.record.title.as_str()))
            .collect::<Vec<_>>(),
    );
    let links = StringArray::from(
        listings
            .iter()
            .map(|l| Some(l.record.link.as_str()))
            .collect::<Vec<_>>(),
    );
    let has_description = BooleanArray::from(listings.iter().map(|l| l.record.has_description()).collect::<Vec<_>>());
    let scores = Float64Array::from(listings.iter().map(|l| l.matching_percentage).collect::<Vec<_>>());
    let skills = StringArray::from(listings.iter().map(|l| Some(l.found_skills_text())).collect::<Vec<_>>());

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(run_ids),
            Arc::new(pages),
            Arc::new(titles),
            Arc::new(links),
            Arc::new(has_description),
            Arc::new(scores),
            Arc::new(skills),
        ],
    )
    .context("building listings record batch")?;

    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn manifest_entry(name: &str, reports_dir: &Path, path: &Path) -> Result<ParquetManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let sha256 = hex::encode(Sha256::digest(&bytes));
    let rel = path.strip_prefix(reports_dir).unwrap_or(path).display().to_string();
    Ok(ParquetManifestFile {
        name: name.to_string(),
        path: rel,
        sha256,
        bytes: bytes.len() as u64,
    })
}

/// Run report directories under `<workspace_root>/reports`, newest first.
pub fn list_run_reports(workspace_root: &Path, limit: usize) -> Result<Vec<RunReport>> {
    let reports_root = workspace_root.join("reports");
    if !reports_root.exists() {
        return Ok(Vec::new());
    }
    let mut reports = Vec::new();
    for entry in std::fs::read_dir(&reports_root).with_context(|| format!("reading {}", reports_root.display()))? {
        let entry = entry?;
        let results_path = entry.path().join("results.json");
        if !results_path.is_file() {
            continue;
        }
        let text = std::fs::read_to_string(&results_path)
            .with_context(|| format!("reading {}", results_path.display()))?;
        match serde_json::from_str::<RunReport>(&text) {
            Ok(report) => reports.push(report),
            Err(err) => warn!(path = %results_path.display(), error = %err, "skipping unreadable run report"),
        }
    }
    reports.sort_by(|a, b| b.meta.started_at.cmp(&a.meta.started_at));
    reports.truncate(limit);
    Ok(reports)
}

pub fn latest_run_report(workspace_root: &Path) -> Result<Option<RunReport>> {
    Ok(list_run_reports(workspace_root, 1)?.into_iter().next())
}

pub fn report_markdown(runs: usize, workspace_root: Option<PathBuf>) -> Result<String> {
    let root = workspace_root.unwrap_or_else(|| PathBuf::from("."));
    let reports = list_run_reports(&root, runs)?;

    let mut lines = vec!["# Job Finder Report".to_string(), String::new()];
    if reports.is_empty() {
        lines.push("No runs recorded yet.".to_string());
    }
    for report in reports {
        let run_dir = root.join("reports").join(report.meta.run_id.to_string());
        let best = report
            .listings
            .iter()
            .max_by(|a, b| a.matching_percentage.total_cmp(&b.matching_percentage));

        lines.push(format!("## Run `{}`", report.meta.run_id));
        lines.push(format!("- query: {}", report.meta.query));
        lines.push(format!(
            "- pages: {}-{} ({} completed)",
            report.meta.range.start(),
            report.meta.range.end(),
            report.pages_completed.len()
        ));
        lines.push(format!("- listings: {}", report.listings.len()));
        if let Some(best) = best {
            lines.push(format!(
                "- best match: {:.2}% {}",
                best.matching_percentage, best.record.title
            ));
        }
        if let Some(failure) = &report.failure {
            lines.push(format!("- failure: {failure}"));
        }
        let manifest_path = run_dir.join("snapshots").join("manifest.json");
        if manifest_path.exists() {
            lines.push(format!("- parquet manifest: `{}`", manifest_path.display()));
        }
        lines.push(String::new());
    }

    Ok(lines.join("\n"))
}
