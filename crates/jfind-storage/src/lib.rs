//! HTTP fetching, raw page archive and the SQLite result store.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use chrono::{DateTime, Utc};
use jfind_core::{ListingRecord, RunMeta, ScoredListing};
use reqwest::header::{HeaderMap, HeaderValue, COOKIE};
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "jfind-storage";

#[derive(Debug, Clone)]
pub struct ArchivedPage {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub deduplicated: bool,
}

/// Content-addressed archive of fetched documents, laid out as `<day>/<host>/<sha256>.html`.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn page_relative_path(&self, fetched_at: DateTime<Utc>, host: &str, content_hash: &str) -> PathBuf {
        let host = host
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
            .collect::<String>();
        let host = if host.is_empty() { "unknown-host".to_string() } else { host };
        PathBuf::from(fetched_at.format("%Y%m%d").to_string())
            .join(host)
            .join(format!("{content_hash}.html"))
    }

    /// Writes the document once; identical bodies on the same day resolve to the same file.
    pub async fn archive_page(
        &self,
        fetched_at: DateTime<Utc>,
        host: &str,
        body: &[u8],
    ) -> anyhow::Result<ArchivedPage> {
        let content_hash = Self::sha256_hex(body);
        let relative_path = self.page_relative_path(fetched_at, host, &content_hash);
        let absolute_path = self.root.join(&relative_path);
        let Some(parent) = absolute_path.parent().map(Path::to_path_buf) else {
            anyhow::bail!("archive path {} has no parent", absolute_path.display());
        };

        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating archive directory {}", parent.display()))?;

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking archive path {}", absolute_path.display()))?
        {
            return Ok(ArchivedPage {
                content_hash,
                relative_path,
                absolute_path,
                deduplicated: true,
            });
        }

        let temp_path = parent.join(format!(".{}.tmp", Uuid::new_v4()));
        let mut file = fs::File::create(&temp_path)
            .await
            .with_context(|| format!("creating temp archive file {}", temp_path.display()))?;
        file.write_all(body)
            .await
            .with_context(|| format!("writing temp archive file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp archive file {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &absolute_path).await {
            let _ = fs::remove_file(&temp_path).await;
            if err.kind() != std::io::ErrorKind::AlreadyExists {
                return Err(err).with_context(|| {
                    format!("moving {} into place at {}", temp_path.display(), absolute_path.display())
                });
            }
        }

        Ok(ArchivedPage {
            content_hash,
            relative_path,
            absolute_path,
            deduplicated: false,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Capped exponential backoff. Also drives element-wait polling in the navigator.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    /// Sent as the `Cookie` header on every request; stands in for an interactive login.
    pub session_cookie: Option<String>,
    pub backoff: BackoffPolicy,
    pub token_bucket: Option<TokenBucketConfig>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            session_cookie: None,
            backoff: BackoffPolicy::default(),
            token_bucket: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

impl TokenBucketConfig {
    /// One token per `1/rate` seconds with no burst beyond a single request.
    pub fn per_second(rate: f64) -> Option<Self> {
        if !(rate.is_finite() && rate > 0.0) {
            return None;
        }
        Some(Self {
            capacity: 1,
            refill_every: Duration::from_secs_f64(1.0 / rate),
        })
    }
}

#[derive(Debug)]
pub struct SimpleTokenBucket {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<TokenBucketState>,
}

#[derive(Debug, Clone, Copy)]
struct TokenBucketState {
    tokens: u32,
    last_refill: Instant,
}

impl SimpleTokenBucket {
    pub fn new(capacity: u32, refill_every: Duration) -> Self {
        Self {
            capacity,
            refill_every,
            state: Mutex::new(TokenBucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    pub async fn take(&self) {
        loop {
            let mut state = self.state.lock().await;
            let elapsed = state.last_refill.elapsed();
            if elapsed >= self.refill_every && !self.refill_every.is_zero() {
                let refills = (elapsed.as_millis() / self.refill_every.as_millis().max(1)) as u32;
                state.tokens = state.tokens.saturating_add(refills).min(self.capacity);
                state.last_refill = Instant::now();
            }

            if state.tokens > 0 {
                state.tokens -= 1;
                return;
            }

            let sleep_for = self.refill_every;
            drop(state);
            tokio::time::sleep(sleep_for).await;
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub fetched_at: DateTime<Utc>,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Sequential HTTP client shared by one navigator session.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    token_bucket: Option<Arc<SimpleTokenBucket>>,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        if let Some(cookie) = &config.session_cookie {
            let value = HeaderValue::from_str(cookie).context("session cookie is not a valid header value")?;
            headers.insert(COOKIE, value);
        }

        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .default_headers(headers);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            token_bucket: config
                .token_bucket
                .map(|c| Arc::new(SimpleTokenBucket::new(c.capacity, c.refill_every))),
            backoff: config.backoff,
        })
    }

    pub fn backoff(&self) -> BackoffPolicy {
        self.backoff
    }

    pub async fn fetch(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", url);
        self.fetch_with_retries(url).instrument(span).await
    }

    async fn fetch_with_retries(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let mut attempt = 0usize;
        loop {
            if let Some(bucket) = &self.token_bucket {
                bucket.take().await;
            }

            let err = match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();
                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        debug!(status = status.as_u16(), bytes = body.len(), "fetched");
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            fetched_at: Utc::now(),
                            body,
                        });
                    }
                    let retry = classify_status(status) == RetryDisposition::Retryable;
                    let err = FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    };
                    if !retry {
                        return Err(err);
                    }
                    err
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::NonRetryable {
                        return Err(FetchError::Request(err));
                    }
                    FetchError::Request(err)
                }
            };

            if attempt >= self.backoff.max_retries {
                return Err(err);
            }
            let delay = self.backoff.delay_for_attempt(attempt);
            debug!(attempt, ?delay, error = %err, "retrying fetch");
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

/// Row read back from the `jobs` table.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredJob {
    pub id: i64,
    pub run_id: Uuid,
    pub query: String,
    pub created_at: DateTime<Utc>,
    pub listing: ScoredListing,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunRow {
    pub run_id: Uuid,
    pub query: String,
    pub listings: usize,
    pub created_at: DateTime<Utc>,
}

/// Append-only SQLite store for scored listings.
#[derive(Debug, Clone)]
pub struct JobStore {
    pool: SqlitePool,
}

impl JobStore {
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .with_context(|| format!("parsing database url {database_url}"))?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .with_context(|| format!("connecting to {database_url}"))?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                run_id TEXT NOT NULL,
                query TEXT NOT NULL,
                page INTEGER NOT NULL,
                title TEXT NOT NULL,
                link TEXT NOT NULL,
                description TEXT NOT NULL,
                matching_percentage REAL NOT NULL,
                found_skills TEXT NOT NULL,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("creating jobs table")?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_run_id ON jobs(run_id)")
            .execute(&self.pool)
            .await
            .context("creating jobs run index")?;
        Ok(())
    }

    /// Inserts every listing of a run in one transaction, preserving order.
    pub async fn append_run(&self, meta: &RunMeta, listings: &[ScoredListing]) -> anyhow::Result<usize> {
        let created_at = Utc::now().to_rfc3339();
        let run_id = meta.run_id.to_string();
        let mut tx = self.pool.begin().await.context("starting jobs transaction")?;
        for listing in listings {
            let found_skills =
                serde_json::to_string(&listing.found_skills).context("serializing found skills")?;
            sqlx::query(
                r#"
                INSERT INTO jobs (run_id, query, page, title, link, description, matching_percentage, found_skills, created_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&run_id)
            .bind(&meta.query)
            .bind(i64::from(listing.page))
            .bind(&listing.record.title)
            .bind(&listing.record.link)
            .bind(&listing.record.description)
            .bind(listing.matching_percentage)
            .bind(found_skills)
            .bind(&created_at)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("inserting listing {}", listing.record.link))?;
        }
        tx.commit().await.context("committing jobs transaction")?;
        info!(run_id = %meta.run_id, rows = listings.len(), "persisted listings");
        Ok(listings.len())
    }

    pub async fn list_run(&self, run_id: Uuid) -> anyhow::Result<Vec<StoredJob>> {
        let rows = sqlx::query(
            r#"
            SELECT id, run_id, query, page, title, link, description, matching_percentage, found_skills, created_at
              FROM jobs
             WHERE run_id = ?
             ORDER BY id
            "#,
        )
        .bind(run_id.to_string())
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("loading jobs for run {run_id}"))?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let page: i64 = row.try_get("page")?;
            let found_skills: String = row.try_get("found_skills")?;
            let listing = ScoredListing {
                page: u32::try_from(page).context("stored page out of range")?,
                record: ListingRecord::new(
                    row.try_get::<String, _>("title")?,
                    row.try_get::<String, _>("link")?,
                    row.try_get::<String, _>("description")?,
                ),
                found_skills: serde_json::from_str(&found_skills).context("parsing stored found skills")?,
                matching_percentage: row.try_get("matching_percentage")?,
            };
            out.push(StoredJob {
                id: row.try_get("id")?,
                run_id: parse_run_id(&row.try_get::<String, _>("run_id")?)?,
                query: row.try_get("query")?,
                created_at: parse_timestamp(&row.try_get::<String, _>("created_at")?)?,
                listing,
            });
        }
        Ok(out)
    }

    /// Most recent runs first.
    pub async fn recent_runs(&self, limit: usize) -> anyhow::Result<Vec<RunRow>> {
        let rows = sqlx::query(
            r#"
            SELECT run_id, MIN(query) AS query, COUNT(*) AS listings, MIN(created_at) AS created_at
              FROM jobs
             GROUP BY run_id
             ORDER BY MAX(id) DESC
             LIMIT ?
            "#,
        )
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .context("loading recent runs")?;

        rows.into_iter()
            .map(|row| -> anyhow::Result<RunRow> {
                let listings: i64 = row.try_get("listings")?;
                Ok(RunRow {
                    run_id: parse_run_id(&row.try_get::<String, _>("run_id")?)?,
                    query: row.try_get("query")?,
                    listings: listings.max(0) as usize,
                    created_at: parse_timestamp(&row.try_get::<String, _>("created_at")?)?,
                })
            })
            .collect()
    }

    pub async fn latest_run_id(&self) -> anyhow::Result<Option<Uuid>> {
        Ok(self.recent_runs(1).await?.into_iter().next().map(|r| r.run_id))
    }
}

fn parse_run_id(text: &str) -> anyhow::Result<Uuid> {
    Uuid::parse_str(text).with_context(|| format!("invalid stored run id {text}"))
}

fn parse_timestamp(text: &str) -> anyhow::Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(text)
        .with_context(|| format!("invalid stored timestamp {text}"))?
        .with_timezone(&Utc))
}
