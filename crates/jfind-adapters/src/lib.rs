//! Site navigation contracts, the HTTP-backed navigator and the listing extractor.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use jfind_core::ListingRecord;
use jfind_storage::{ArtifactStore, BackoffPolicy, HttpFetcher};
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

pub const CRATE_NAME: &str = "jfind-adapters";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NavigatorError {
    #[error("invalid locator `{locator}`: {reason}")]
    InvalidLocator { locator: String, reason: String },
    #[error("timed out after {waited_ms} ms waiting for `{locator}`")]
    Timeout { locator: String, waited_ms: u128 },
    #[error("no element matches `{locator}`")]
    NotFound { locator: String },
    #[error("failed to load {url}: {reason}")]
    Load { url: String, reason: String },
    #[error("no page has been loaded")]
    NoPage,
    #[error("no active browsing context")]
    NoActiveContext,
    #[error("the primary view cannot be closed")]
    NoTransientContext,
    #[error("browser session lost: {0}")]
    SessionLost(String),
}

/// CSS selector addressing elements on a page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Locator(String);

impl Locator {
    pub fn css(selector: impl Into<String>) -> Self {
        Self(selector.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn selector(&self) -> Result<Selector, NavigatorError> {
        Selector::parse(&self.0).map_err(|e| NavigatorError::InvalidLocator {
            locator: self.0.clone(),
            reason: e.to_string(),
        })
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn visible_text(element: ElementRef<'_>) -> String {
    element
        .text()
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn non_empty(value: String) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

/// Detached snapshot of an element: its outer HTML and collapsed visible text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElementHandle {
    html: String,
    text: String,
}

impl ElementHandle {
    pub fn from_html(html: impl Into<String>) -> Self {
        let html = html.into();
        let text = visible_text(Html::parse_fragment(&html).root_element());
        Self { html, text }
    }

    fn from_element(element: ElementRef<'_>) -> Self {
        Self {
            html: element.html(),
            text: visible_text(element),
        }
    }

    pub fn html(&self) -> &str {
        &self.html
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn find_text(&self, locator: &Locator) -> Result<Option<String>, NavigatorError> {
        let selector = locator.selector()?;
        let fragment = Html::parse_fragment(&self.html);
        let text = fragment.select(&selector).next().map(visible_text);
        Ok(text.and_then(non_empty))
    }

    pub fn find_attr(&self, locator: &Locator, attr: &str) -> Result<Option<String>, NavigatorError> {
        let selector = locator.selector()?;
        let fragment = Html::parse_fragment(&self.html);
        let value = fragment
            .select(&selector)
            .next()
            .and_then(|el| el.value().attr(attr))
            .map(|v| v.trim().to_string());
        Ok(value.and_then(non_empty))
    }
}

/// A stateful browsing session with one primary view and at most a stack of transient contexts.
///
/// `open_in_new_context` makes the new context active even when loading it
/// fails, the way a browser tab shows an error page. `close_context` closes
/// the active transient context and leaves no context active until
/// `switch_to_primary` is called.
#[async_trait]
pub trait Navigator: Send + Sync {
    async fn load(&mut self, url: &str) -> Result<(), NavigatorError>;

    async fn wait_for_clickable(&mut self, locator: &Locator, timeout: Duration) -> Result<(), NavigatorError>;

    async fn find_all(&self, locator: &Locator) -> Result<Vec<ElementHandle>, NavigatorError>;

    async fn open_in_new_context(&mut self, url: &str) -> Result<(), NavigatorError>;

    async fn close_context(&mut self) -> Result<(), NavigatorError>;

    async fn switch_to_primary(&mut self) -> Result<(), NavigatorError>;

    async fn read_text(&self, locator: &Locator) -> Result<Option<String>, NavigatorError>;

    fn current_url(&self) -> Option<&str>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    pub url: String,
    pub body: String,
}

/// Where a [`PageNavigator`] gets its documents from.
#[async_trait]
pub trait DocumentSource: Send + Sync {
    async fn fetch_document(&self, url: &str) -> Result<Document, NavigatorError>;
}

pub struct HttpSource {
    http: Arc<HttpFetcher>,
    archive: Option<ArtifactStore>,
}

impl HttpSource {
    pub fn new(http: Arc<HttpFetcher>) -> Self {
        Self { http, archive: None }
    }

    pub fn with_archive(mut self, archive: ArtifactStore) -> Self {
        self.archive = Some(archive);
        self
    }
}

#[async_trait]
impl DocumentSource for HttpSource {
    async fn fetch_document(&self, url: &str) -> Result<Document, NavigatorError> {
        let resp = self.http.fetch(url).await.map_err(|e| NavigatorError::Load {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

        if let Some(archive) = &self.archive {
            let host = Url::parse(&resp.final_url)
                .ok()
                .and_then(|u| u.host_str().map(ToString::to_string))
                .unwrap_or_default();
            match archive.archive_page(resp.fetched_at, &host, &resp.body).await {
                Ok(page) => debug!(path = %page.relative_path.display(), "archived page"),
                Err(err) => warn!(url, error = %err, "failed to archive page"),
            }
        }

        Ok(Document {
            body: resp.text(),
            url: resp.final_url,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FixtureFailure {
    Unreachable,
    SessionLost,
}

/// In-memory documents keyed by exact URL; anything else fails to load.
#[derive(Debug, Clone, Default)]
pub struct FixtureSource {
    pages: HashMap<String, String>,
    failures: HashMap<String, FixtureFailure>,
}

#[derive(Debug, Deserialize)]
struct FixtureManifest {
    pages: Vec<FixtureManifestPage>,
    #[serde(default)]
    session_lost: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct FixtureManifestPage {
    url: String,
    file: String,
}

impl FixtureSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_page(mut self, url: impl Into<String>, html: impl Into<String>) -> Self {
        self.pages.insert(url.into(), html.into());
        self
    }

    pub fn with_unreachable(mut self, url: impl Into<String>) -> Self {
        self.failures.insert(url.into(), FixtureFailure::Unreachable);
        self
    }

    pub fn with_session_lost(mut self, url: impl Into<String>) -> Self {
        self.failures.insert(url.into(), FixtureFailure::SessionLost);
        self
    }

    /// Reads a YAML manifest listing `url` → `file` pairs; files resolve relative to the manifest.
    pub fn load_manifest(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let manifest: FixtureManifest =
            serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));

        let mut source = Self::new();
        for page in manifest.pages {
            let file = base.join(&page.file);
            let html = fs::read_to_string(&file).with_context(|| format!("reading fixture {}", file.display()))?;
            source = source.with_page(page.url, html);
        }
        for url in manifest.session_lost {
            source = source.with_session_lost(url);
        }
        Ok(source)
    }
}

#[async_trait]
impl DocumentSource for FixtureSource {
    async fn fetch_document(&self, url: &str) -> Result<Document, NavigatorError> {
        match self.failures.get(url) {
            Some(FixtureFailure::SessionLost) => {
                return Err(NavigatorError::SessionLost(format!("fixture session dropped at {url}")))
            }
            Some(FixtureFailure::Unreachable) => {
                return Err(NavigatorError::Load {
                    url: url.to_string(),
                    reason: "fixture marked unreachable".to_string(),
                })
            }
            None => {}
        }
        self.pages
            .get(url)
            .map(|body| Document {
                url: url.to_string(),
                body: body.clone(),
            })
            .ok_or_else(|| NavigatorError::Load {
                url: url.to_string(),
                reason: "no fixture for url".to_string(),
            })
    }
}

#[derive(Debug, Clone)]
struct BrowsingContext {
    url: String,
    body: Option<String>,
}

/// Navigator over static documents. Index 0 of the context stack is the primary view.
///
/// "Clickable" means present in the document. Waiting checks the loaded
/// document, then re-fetches it at most `poll.max_retries` times on the
/// poll schedule, giving up early once the timeout elapses.
pub struct PageNavigator<S> {
    source: S,
    contexts: Vec<BrowsingContext>,
    active: Option<usize>,
    poll: BackoffPolicy,
}

pub type HttpNavigator = PageNavigator<HttpSource>;

impl<S: DocumentSource> PageNavigator<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            contexts: Vec::new(),
            active: None,
            poll: BackoffPolicy::default(),
        }
    }

    pub fn with_poll_policy(mut self, poll: BackoffPolicy) -> Self {
        self.poll = poll;
        self
    }

    pub fn open_contexts(&self) -> usize {
        self.contexts.len()
    }

    pub fn is_on_primary(&self) -> bool {
        self.active == Some(0)
    }

    fn active_context(&self) -> Result<&BrowsingContext, NavigatorError> {
        if self.contexts.is_empty() {
            return Err(NavigatorError::NoPage);
        }
        let idx = self.active.ok_or(NavigatorError::NoActiveContext)?;
        self.contexts.get(idx).ok_or(NavigatorError::NoActiveContext)
    }

    fn active_context_mut(&mut self) -> Result<&mut BrowsingContext, NavigatorError> {
        if self.contexts.is_empty() {
            return Err(NavigatorError::NoPage);
        }
        let idx = self.active.ok_or(NavigatorError::NoActiveContext)?;
        self.contexts.get_mut(idx).ok_or(NavigatorError::NoActiveContext)
    }

    fn active_body(&self) -> Result<&str, NavigatorError> {
        let ctx = self.active_context()?;
        ctx.body.as_deref().ok_or_else(|| NavigatorError::Load {
            url: ctx.url.clone(),
            reason: "document not loaded".to_string(),
        })
    }
}

fn document_matches(body: &str, locator: &Locator) -> Result<bool, NavigatorError> {
    let selector = locator.selector()?;
    Ok(Html::parse_document(body).select(&selector).next().is_some())
}

fn document_handles(body: &str, locator: &Locator) -> Result<Vec<ElementHandle>, NavigatorError> {
    let selector = locator.selector()?;
    let document = Html::parse_document(body);
    Ok(document.select(&selector).map(ElementHandle::from_element).collect())
}

fn document_text(body: &str, locator: &Locator) -> Result<Option<String>, NavigatorError> {
    let selector = locator.selector()?;
    let document = Html::parse_document(body);
    Ok(document.select(&selector).next().map(visible_text))
}

#[async_trait]
impl<S: DocumentSource> Navigator for PageNavigator<S> {
    async fn load(&mut self, url: &str) -> Result<(), NavigatorError> {
        if self.contexts.is_empty() {
            self.contexts.push(BrowsingContext {
                url: url.to_string(),
                body: None,
            });
            self.active = Some(0);
        }
        let fetched = self.source.fetch_document(url).await;
        let ctx = self.active_context_mut()?;
        ctx.url = url.to_string();
        ctx.body = None;
        let doc = fetched?;
        ctx.url = doc.url;
        ctx.body = Some(doc.body);
        Ok(())
    }

    async fn wait_for_clickable(&mut self, locator: &Locator, timeout: Duration) -> Result<(), NavigatorError> {
        let started = Instant::now();
        let mut attempt = 0usize;
        loop {
            let ctx = self.active_context()?;
            if let Some(body) = ctx.body.as_deref() {
                if document_matches(body, locator)? {
                    return Ok(());
                }
            }
            let url = ctx.url.clone();

            let elapsed = started.elapsed();
            if elapsed >= timeout || attempt >= self.poll.max_retries {
                return Err(NavigatorError::Timeout {
                    locator: locator.to_string(),
                    waited_ms: elapsed.as_millis(),
                });
            }
            tokio::time::sleep(self.poll.delay_for_attempt(attempt).min(timeout - elapsed)).await;
            attempt += 1;

            match self.source.fetch_document(&url).await {
                Ok(doc) => self.active_context_mut()?.body = Some(doc.body),
                Err(NavigatorError::SessionLost(reason)) => return Err(NavigatorError::SessionLost(reason)),
                Err(err) => debug!(%url, attempt, error = %err, "re-fetch while waiting failed"),
            }
        }
    }

    async fn find_all(&self, locator: &Locator) -> Result<Vec<ElementHandle>, NavigatorError> {
        document_handles(self.active_body()?, locator)
    }

    async fn open_in_new_context(&mut self, url: &str) -> Result<(), NavigatorError> {
        if self.contexts.is_empty() {
            return Err(NavigatorError::NoPage);
        }
        self.contexts.push(BrowsingContext {
            url: url.to_string(),
            body: None,
        });
        self.active = Some(self.contexts.len() - 1);
        let doc = self.source.fetch_document(url).await?;
        let ctx = self.active_context_mut()?;
        ctx.url = doc.url;
        ctx.body = Some(doc.body);
        Ok(())
    }

    async fn close_context(&mut self) -> Result<(), NavigatorError> {
        match self.active {
            None => Err(NavigatorError::NoActiveContext),
            Some(0) => Err(NavigatorError::NoTransientContext),
            Some(idx) => {
                self.contexts.remove(idx);
                self.active = None;
                Ok(())
            }
        }
    }

    async fn switch_to_primary(&mut self) -> Result<(), NavigatorError> {
        if self.contexts.is_empty() {
            return Err(NavigatorError::NoPage);
        }
        self.active = Some(0);
        Ok(())
    }

    async fn read_text(&self, locator: &Locator) -> Result<Option<String>, NavigatorError> {
        document_text(self.active_body()?, locator)
    }

    fn current_url(&self) -> Option<&str> {
        self.active_context().ok().map(|ctx| ctx.url.as_str())
    }
}

/// Where listings live on the target site and how its search pages are addressed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SiteProfile {
    pub name: String,
    pub base_url: String,
    pub search_path: String,
    pub page_param: String,
    pub query_param: String,
    /// Index the site uses for the first results page.
    pub first_page_index: u32,
    pub listing_header: Locator,
    pub listing_link: Locator,
    pub description: Locator,
}

impl Default for SiteProfile {
    fn default() -> Self {
        Self {
            name: "hh.ru".to_string(),
            base_url: "https://hh.ru".to_string(),
            search_path: "/search/vacancy".to_string(),
            page_param: "page".to_string(),
            query_param: "text".to_string(),
            first_page_index: 0,
            listing_header: Locator::css("h2.bloko-header-section-2"),
            listing_link: Locator::css("a.bloko-link"),
            description: Locator::css("div.vacancy-description"),
        }
    }
}

impl SiteProfile {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            info!(path = %path.display(), "site profile not found; using built-in hh.ru profile");
            return Ok(Self::default());
        }
        Self::load(path)
    }

    /// URL of the 1-based results `page` for `query`.
    pub fn page_url(&self, query: &str, page: u32) -> Result<Url, url::ParseError> {
        let mut url = Url::parse(&self.base_url)?.join(&self.search_path)?;
        let index = page.saturating_sub(1) + self.first_page_index;
        url.query_pairs_mut()
            .append_pair(&self.page_param, &index.to_string())
            .append_pair(&self.query_param, query);
        Ok(url)
    }
}

/// The step of a listing's extraction that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListingStep {
    Title,
    Link,
    OpenDetail,
    WaitDescription,
    ReadDescription,
    RestorePrimary,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListingIssue {
    pub page: u32,
    pub index: usize,
    pub step: ListingStep,
    pub message: String,
}

/// Everything one results page produced.
#[derive(Debug, Clone, PartialEq)]
pub struct PageBatch {
    pub page: u32,
    /// Listing entries found on the page, including skipped ones.
    pub entries: usize,
    pub records: Vec<ListingRecord>,
    /// Entries dropped because their title or link could not be read.
    pub skipped: Vec<ListingIssue>,
    /// Records emitted with the unavailable-description placeholder.
    pub degraded: Vec<ListingIssue>,
    /// Set when the navigator could not be returned to the results view; later entries were not attempted.
    pub aborted: Option<NavigatorError>,
}

impl PageBatch {
    fn new(page: u32) -> Self {
        Self {
            page,
            entries: 0,
            records: Vec::new(),
            skipped: Vec::new(),
            degraded: Vec::new(),
            aborted: None,
        }
    }
}

type StepError = (ListingStep, NavigatorError);

#[derive(Debug, Clone)]
pub struct Extractor {
    site: SiteProfile,
    wait_timeout: Duration,
}

impl Extractor {
    pub fn new(site: SiteProfile, wait_timeout: Duration) -> Self {
        Self { site, wait_timeout }
    }

    pub fn site(&self) -> &SiteProfile {
        &self.site
    }

    /// Extracts every listing on the results page the navigator currently shows, in page order.
    ///
    /// Each listing is attempted once. A listing whose detail cannot be read
    /// is kept with the placeholder description; one whose title or link
    /// cannot be read is skipped. The navigator is back on the results view
    /// when this returns unless `aborted` is set.
    pub async fn extract_page<N: Navigator + ?Sized>(&self, nav: &mut N, page: u32) -> PageBatch {
        let mut batch = PageBatch::new(page);
        let base_url = nav.current_url().map(ToString::to_string);

        let headers = match nav.find_all(&self.site.listing_header).await {
            Ok(headers) => headers,
            Err(err) => {
                warn!(page, error = %err, "could not enumerate listings");
                batch.aborted = Some(err);
                return batch;
            }
        };
        batch.entries = headers.len();
        debug!(page, entries = headers.len(), "enumerated listings");

        for (index, header) in headers.iter().enumerate() {
            let (title, link) = match self.title_and_link(header, base_url.as_deref()) {
                Ok(pair) => pair,
                Err((step, message)) => {
                    warn!(page, index, ?step, %message, "skipping listing");
                    batch.skipped.push(ListingIssue {
                        page,
                        index,
                        step,
                        message,
                    });
                    continue;
                }
            };

            let (description, restored) = self.read_in_detail_context(nav, &link).await;
            match description {
                Ok(text) => batch.records.push(ListingRecord::new(title, link, text)),
                Err((step, err)) => {
                    warn!(page, index, ?step, %link, error = %err, "description unavailable");
                    batch.degraded.push(ListingIssue {
                        page,
                        index,
                        step,
                        message: err.to_string(),
                    });
                    batch.records.push(ListingRecord::unavailable(title, link));
                }
            }

            if let Err(err) = restored {
                warn!(page, index, step = ?ListingStep::RestorePrimary, error = %err, "lost the results view");
                batch.aborted = Some(err);
                break;
            }
        }

        batch
    }

    fn title_and_link(
        &self,
        header: &ElementHandle,
        base_url: Option<&str>,
    ) -> Result<(String, String), (ListingStep, String)> {
        let title = header.text().trim().to_string();
        if title.is_empty() {
            return Err((ListingStep::Title, "listing header has no text".to_string()));
        }
        let href = header
            .find_attr(&self.site.listing_link, "href")
            .map_err(|e| (ListingStep::Link, e.to_string()))?
            .ok_or_else(|| (ListingStep::Link, format!("no `{}` with href", self.site.listing_link)))?;
        let link = resolve_link(base_url, &href).map_err(|e| (ListingStep::Link, e))?;
        Ok((title, link))
    }

    /// Reads the description in a transient context, then always closes it and returns to the primary view.
    async fn read_in_detail_context<N: Navigator + ?Sized>(
        &self,
        nav: &mut N,
        link: &str,
    ) -> (Result<String, StepError>, Result<(), NavigatorError>) {
        let description = self.read_description(nav, link).await;

        let closed = nav.close_context().await;
        let restored = nav.switch_to_primary().await;
        if let Err(err) = closed {
            if err != NavigatorError::NoTransientContext {
                warn!(%link, error = %err, "closing detail context failed");
            }
        }
        (description, restored)
    }

    async fn read_description<N: Navigator + ?Sized>(&self, nav: &mut N, link: &str) -> Result<String, StepError> {
        nav.open_in_new_context(link)
            .await
            .map_err(|e| (ListingStep::OpenDetail, e))?;
        nav.wait_for_clickable(&self.site.description, self.wait_timeout)
            .await
            .map_err(|e| (ListingStep::WaitDescription, e))?;
        match nav.read_text(&self.site.description).await {
            Ok(Some(text)) => Ok(text),
            Ok(None) => Err((
                ListingStep::ReadDescription,
                NavigatorError::NotFound {
                    locator: self.site.description.to_string(),
                },
            )),
            Err(err) => Err((ListingStep::ReadDescription, err)),
        }
    }
}

/// Absolute http(s) URL for `href`, resolved against the page it was found on.
pub fn resolve_link(base_url: Option<&str>, href: &str) -> Result<String, String> {
    let parsed = match Url::parse(href) {
        Ok(url) => url,
        Err(url::ParseError::RelativeUrlWithoutBase) => {
            let base = base_url.ok_or_else(|| format!("relative link `{href}` without a base page"))?;
            Url::parse(base)
                .and_then(|b| b.join(href))
                .map_err(|e| format!("cannot resolve `{href}`: {e}"))?
        }
        Err(err) => return Err(format!("invalid link `{href}`: {err}")),
    };
    match parsed.scheme() {
        "http" | "https" => Ok(parsed.to_string()),
        other => Err(format!("unsupported link scheme `{other}` in `{href}`")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jfind_core::DESCRIPTION_UNAVAILABLE;
    use std::path::PathBuf;

    const SHORT_WAIT: Duration = Duration::from_millis(30);

    fn fast_poll() -> BackoffPolicy {
        BackoffPolicy {
            max_retries: 0,
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(10),
        }
    }

    fn workspace_root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .canonicalize()
            .expect("workspace root")
    }

    fn fixture_navigator() -> PageNavigator<FixtureSource> {
        let source = FixtureSource::load_manifest(workspace_root().join("fixtures/hh/manifest.yaml"))
            .expect("fixture manifest");
        PageNavigator::new(source).with_poll_policy(fast_poll())
    }

    fn search_url(page: u32) -> String {
        SiteProfile::default().page_url("rust", page).unwrap().to_string()
    }

    #[test]
    fn page_url_is_zero_based_and_encoded() {
        let url = SiteProfile::default().page_url("rust developer", 1).unwrap();
        assert_eq!(url.as_str(), "https://hh.ru/search/vacancy?page=0&text=rust+developer");
        let url = SiteProfile::default().page_url("rust", 3).unwrap();
        assert_eq!(url.as_str(), "https://hh.ru/search/vacancy?page=2&text=rust");
    }

    #[test]
    fn site_profile_yaml_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("site.yaml");
        fs::write(&path, "base_url: https://jobs.example\nfirst_page_index: 1\ndescription: article.body\n").unwrap();
        let site = SiteProfile::load(&path).unwrap();
        assert_eq!(site.base_url, "https://jobs.example");
        assert_eq!(site.description, Locator::css("article.body"));
        assert_eq!(site.listing_link, SiteProfile::default().listing_link);
        assert_eq!(
            site.page_url("go", 1).unwrap().as_str(),
            "https://jobs.example/search/vacancy?page=1&text=go"
        );
        let missing = SiteProfile::load_or_default(dir.path().join("absent.yaml")).unwrap();
        assert_eq!(missing, SiteProfile::default());
    }

    #[test]
    fn shipped_site_profile_matches_builtin() {
        let site = SiteProfile::load(workspace_root().join("site.yaml")).unwrap();
        assert_eq!(site, SiteProfile::default());
    }

    #[test]
    fn element_handle_reads_descendants() {
        let handle = ElementHandle::from_html(
            r#"<h2 class="t"><a class="bloko-link" href=" /vacancy/7 ">  Rust
                 Engineer </a></h2>"#,
        );
        assert_eq!(handle.text(), "Rust Engineer");
        let link = Locator::css("a.bloko-link");
        assert_eq!(handle.find_attr(&link, "href").unwrap().as_deref(), Some("/vacancy/7"));
        assert_eq!(handle.find_text(&link).unwrap().as_deref(), Some("Rust Engineer"));
        assert_eq!(handle.find_attr(&Locator::css("span"), "href").unwrap(), None);
        assert!(matches!(
            handle.find_text(&Locator::css("a[")),
            Err(NavigatorError::InvalidLocator { .. })
        ));
    }

    #[test]
    fn links_resolve_against_page_and_reject_other_schemes() {
        let base = Some("https://hh.ru/search/vacancy?page=0&text=rust");
        assert_eq!(resolve_link(base, "/vacancy/1").unwrap(), "https://hh.ru/vacancy/1");
        assert_eq!(
            resolve_link(None, "https://hh.ru/vacancy/2").unwrap(),
            "https://hh.ru/vacancy/2"
        );
        assert!(resolve_link(None, "/vacancy/3").is_err());
        assert!(resolve_link(base, "javascript:void(0)").is_err());
    }

    #[tokio::test]
    async fn context_stack_follows_browser_semantics() {
        let mut nav = fixture_navigator();
        assert_eq!(nav.switch_to_primary().await, Err(NavigatorError::NoPage));

        nav.load(&search_url(1)).await.unwrap();
        assert_eq!(nav.close_context().await, Err(NavigatorError::NoTransientContext));

        nav.open_in_new_context("https://hh.ru/vacancy/1001").await.unwrap();
        assert_eq!(nav.current_url(), Some("https://hh.ru/vacancy/1001"));
        nav.close_context().await.unwrap();
        assert_eq!(
            nav.read_text(&Locator::css("h2")).await,
            Err(NavigatorError::NoActiveContext)
        );
        nav.switch_to_primary().await.unwrap();
        assert_eq!(nav.open_contexts(), 1);
        assert_eq!(nav.current_url(), Some(search_url(1).as_str()));
    }

    #[tokio::test]
    async fn failed_open_still_activates_the_new_context() {
        let mut nav = fixture_navigator();
        nav.load(&search_url(1)).await.unwrap();
        let err = nav.open_in_new_context("https://hh.ru/vacancy/404").await.unwrap_err();
        assert!(matches!(err, NavigatorError::Load { .. }));
        assert_eq!(nav.open_contexts(), 2);
        nav.close_context().await.unwrap();
        nav.switch_to_primary().await.unwrap();
        assert!(nav.is_on_primary());
    }

    #[tokio::test]
    async fn wait_times_out_when_element_never_appears() {
        let mut nav = fixture_navigator();
        nav.load(&search_url(1)).await.unwrap();
        let err = nav
            .wait_for_clickable(&Locator::css("div.vacancy-description"), SHORT_WAIT)
            .await
            .unwrap_err();
        assert!(matches!(err, NavigatorError::Timeout { .. }));
        nav.wait_for_clickable(&Locator::css("h2.bloko-header-section-2"), SHORT_WAIT)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn extracts_listings_in_page_order_with_placeholder_for_unreachable_detail() {
        let mut nav = fixture_navigator();
        nav.load(&search_url(1)).await.unwrap();
        let extractor = Extractor::new(SiteProfile::default(), SHORT_WAIT);

        let batch = extractor.extract_page(&mut nav, 1).await;

        assert_eq!(batch.entries, 4);
        assert!(batch.aborted.is_none());
        let titles = batch.records.iter().map(|r| r.title.as_str()).collect::<Vec<_>>();
        assert_eq!(
            titles,
            vec!["Senior Rust Developer", "Python Backend Engineer", "Data Analyst (SQL)"]
        );
        assert_eq!(batch.records[1].link, "https://hh.ru/vacancy/1002");
        assert!(batch.records[0].description.contains("Tokio"));
        assert_eq!(batch.records[2].description, DESCRIPTION_UNAVAILABLE);
        assert!(batch
            .records
            .iter()
            .all(|r| !r.title.is_empty() && Url::parse(&r.link).is_ok()));

        assert_eq!(batch.skipped.len(), 1);
        assert_eq!(batch.skipped[0].index, 2);
        assert_eq!(batch.skipped[0].step, ListingStep::Link);
        assert_eq!(batch.degraded.len(), 1);
        assert_eq!(batch.degraded[0].step, ListingStep::OpenDetail);
        assert!(batch.records.len() >= batch.entries - batch.skipped.len());

        assert!(nav.is_on_primary());
        assert_eq!(nav.open_contexts(), 1);
        assert_eq!(nav.current_url(), Some(search_url(1).as_str()));
    }

    #[tokio::test]
    async fn detail_without_description_times_out_into_placeholder() {
        let page = r#"<html><body><h2 class="bloko-header-section-2"><a class="bloko-link" href="https://hh.ru/vacancy/9">Empty</a></h2></body></html>"#;
        let source = FixtureSource::new()
            .with_page(search_url(1), page)
            .with_page("https://hh.ru/vacancy/9", "<html><body><p>gone</p></body></html>");
        let mut nav = PageNavigator::new(source).with_poll_policy(fast_poll());
        nav.load(&search_url(1)).await.unwrap();

        let batch = Extractor::new(SiteProfile::default(), SHORT_WAIT)
            .extract_page(&mut nav, 1)
            .await;
        assert_eq!(batch.records.len(), 1);
        assert!(!batch.records[0].has_description());
        assert_eq!(batch.degraded[0].step, ListingStep::WaitDescription);
        assert!(nav.is_on_primary());
    }

    /// Counts requests per URL on top of a fixture source.
    struct CountingSource {
        inner: FixtureSource,
        fetches: Arc<std::sync::Mutex<HashMap<String, usize>>>,
    }

    #[async_trait]
    impl DocumentSource for CountingSource {
        async fn fetch_document(&self, url: &str) -> Result<Document, NavigatorError> {
            *self.fetches.lock().unwrap().entry(url.to_string()).or_default() += 1;
            self.inner.fetch_document(url).await
        }
    }

    #[tokio::test]
    async fn waiting_for_a_missing_description_refetches_a_bounded_number_of_times() {
        let page = r#"<html><body><h2 class="bloko-header-section-2"><a class="bloko-link" href="https://hh.ru/vacancy/9">Static</a></h2></body></html>"#;
        let fetches = Arc::new(std::sync::Mutex::new(HashMap::new()));
        let source = CountingSource {
            inner: FixtureSource::new()
                .with_page(search_url(1), page)
                .with_page("https://hh.ru/vacancy/9", "<html><body><p>no description</p></body></html>"),
            fetches: fetches.clone(),
        };
        let poll = BackoffPolicy {
            max_retries: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(1),
        };
        let mut nav = PageNavigator::new(source).with_poll_policy(poll);
        nav.load(&search_url(1)).await.unwrap();

        let batch = Extractor::new(SiteProfile::default(), Duration::from_secs(5))
            .extract_page(&mut nav, 1)
            .await;

        assert_eq!(batch.degraded[0].step, ListingStep::WaitDescription);
        // one open plus at most two re-checks, however long the timeout
        assert_eq!(fetches.lock().unwrap()["https://hh.ru/vacancy/9"], 3);
        assert_eq!(fetches.lock().unwrap()[&search_url(1)], 1);
    }

    #[tokio::test]
    async fn empty_description_block_is_kept_as_empty_text() {
        let page = r#"<html><body><h2 class="bloko-header-section-2"><a class="bloko-link" href="https://hh.ru/vacancy/8">Blank</a></h2></body></html>"#;
        let source = FixtureSource::new().with_page(search_url(1), page).with_page(
            "https://hh.ru/vacancy/8",
            r#"<html><body><div class="vacancy-description">  </div></body></html>"#,
        );
        let mut nav = PageNavigator::new(source).with_poll_policy(fast_poll());
        nav.load(&search_url(1)).await.unwrap();

        let batch = Extractor::new(SiteProfile::default(), SHORT_WAIT)
            .extract_page(&mut nav, 1)
            .await;

        assert_eq!(batch.records.len(), 1);
        assert_eq!(batch.records[0].description, "");
        assert!(batch.degraded.is_empty());
    }

    /// Delegates to a fixture navigator but cannot return to the primary view after the first detail.
    struct StuckNavigator {
        inner: PageNavigator<FixtureSource>,
        details_opened: usize,
    }

    #[async_trait]
    impl Navigator for StuckNavigator {
        async fn load(&mut self, url: &str) -> Result<(), NavigatorError> {
            self.inner.load(url).await
        }

        async fn wait_for_clickable(&mut self, locator: &Locator, timeout: Duration) -> Result<(), NavigatorError> {
            self.inner.wait_for_clickable(locator, timeout).await
        }

        async fn find_all(&self, locator: &Locator) -> Result<Vec<ElementHandle>, NavigatorError> {
            self.inner.find_all(locator).await
        }

        async fn open_in_new_context(&mut self, url: &str) -> Result<(), NavigatorError> {
            self.details_opened += 1;
            self.inner.open_in_new_context(url).await
        }

        async fn close_context(&mut self) -> Result<(), NavigatorError> {
            self.inner.close_context().await
        }

        async fn switch_to_primary(&mut self) -> Result<(), NavigatorError> {
            Err(NavigatorError::SessionLost("window handle vanished".to_string()))
        }

        async fn read_text(&self, locator: &Locator) -> Result<Option<String>, NavigatorError> {
            self.inner.read_text(locator).await
        }

        fn current_url(&self) -> Option<&str> {
            self.inner.current_url()
        }
    }

    #[tokio::test]
    async fn losing_the_results_view_aborts_but_keeps_extracted_record() {
        let mut inner = fixture_navigator();
        inner.load(&search_url(1)).await.unwrap();
        let mut nav = StuckNavigator {
            inner,
            details_opened: 0,
        };

        let batch = Extractor::new(SiteProfile::default(), SHORT_WAIT)
            .extract_page(&mut nav, 1)
            .await;

        assert_eq!(nav.details_opened, 1);
        assert_eq!(batch.records.len(), 1);
        assert_eq!(batch.records[0].title, "Senior Rust Developer");
        assert!(batch.records[0].has_description());
        assert!(matches!(batch.aborted, Some(NavigatorError::SessionLost(_))));
    }
}
