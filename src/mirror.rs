use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::archive::zip_directory;
use crate::charset;
use crate::auth::{Authenticator, Credentials, FormLogin};
use crate::downloader::{
    AssetFetcher, FetchResult, HttpFetcher, SessionContext, SessionCookie, DEFAULT_USER_AGENT,
};
use crate::error::{AssetError, FetchError, MirrorError};
use crate::file_manager::FileManager;
use crate::html_parser::{AssetReference, HtmlParser};
use crate::rewriter::{relative_href, rewrite};
use crate::url_mapper::{map_url, AssetCategory, LocalPath};

pub const DEFAULT_MAX_CONCURRENT: usize = 8;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// What to mirror and where. Fixed for the lifetime of a run.
#[derive(Debug, Clone)]
pub struct MirrorTarget {
    pub root_url: Url,
    pub output_root: PathBuf,
}

impl MirrorTarget {
    pub fn new(root_url: &str, output_root: impl Into<PathBuf>) -> Result<Self, MirrorError> {
        let root_url = parse_root_url(root_url)?;
        Ok(Self {
            root_url,
            output_root: output_root.into(),
        })
    }

    /// Mirrors into `./<host>`, dropping a leading `www.`.
    pub fn in_current_dir(root_url: &str) -> Result<Self, MirrorError> {
        let root_url = parse_root_url(root_url)?;
        let output_root = default_output_dir(&root_url);
        Ok(Self {
            root_url,
            output_root,
        })
    }
}

fn parse_root_url(raw: &str) -> Result<Url, MirrorError> {
    let invalid = |reason: String| MirrorError::InvalidTarget {
        url: raw.to_string(),
        reason,
    };
    let url = Url::parse(raw.trim()).map_err(|e| invalid(e.to_string()))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(invalid(format!("unsupported scheme `{}`", url.scheme())));
    }
    if url.host_str().map_or(true, str::is_empty) {
        return Err(invalid("missing host".to_string()));
    }
    Ok(url)
}

fn default_output_dir(root_url: &Url) -> PathBuf {
    let host = root_url.host_str().unwrap_or("mirror");
    let host = host.strip_prefix("www.").unwrap_or(host);
    let name = match root_url.port() {
        Some(port) => format!("{host}_{port}"),
        None => host.to_string(),
    };
    PathBuf::from(name.replace(':', "_"))
}

#[derive(Debug, Clone)]
pub struct MirrorOptions {
    /// In-flight asset fetches. Values below 1 are treated as 1.
    pub max_concurrent: usize,
    pub timeout: Duration,
    pub user_agent: String,
    /// Cookies to send without running a login.
    pub cookies: Vec<SessionCookie>,
    /// Produce `<output_root>.zip` after a successful run.
    pub archive: bool,
    pub show_progress: bool,
}

impl Default for MirrorOptions {
    fn default() -> Self {
        Self {
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            timeout: DEFAULT_TIMEOUT,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            cookies: Vec::new(),
            archive: false,
            show_progress: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MirrorPhase {
    Idle,
    FetchingRoot,
    Scanning,
    FetchingAssets,
    Rewriting,
    WritingRoot,
    Archiving,
    Done,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct AssetFailure {
    pub url: String,
    pub code: &'static str,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct MirrorSummary {
    pub root_url: String,
    pub output_root: PathBuf,
    pub total_assets: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub elapsed: Duration,
    /// Succeeded assets per category.
    pub by_category: BTreeMap<AssetCategory, usize>,
    /// In document order.
    pub failures: Vec<AssetFailure>,
    pub parse_warnings: usize,
    pub archive: Option<PathBuf>,
}

/// A unique asset scheduled for download.
struct PlannedAsset {
    index: usize,
    reference: AssetReference,
    local: LocalPath,
}

struct AssetReport {
    index: usize,
    url: Url,
    local: LocalPath,
    result: Result<PathBuf, AssetError>,
}

/// Drives one page through fetch, scan, asset fan-out, rewrite and write.
pub struct Mirror<F = HttpFetcher, A = FormLogin> {
    options: MirrorOptions,
    fetcher: Arc<F>,
    authenticator: A,
    cancel: CancellationToken,
    phase: watch::Sender<MirrorPhase>,
}

impl Mirror {
    pub fn new(options: MirrorOptions) -> Self {
        let login = FormLogin::new(options.user_agent.clone(), options.timeout);
        Self::with_parts(options, HttpFetcher, login)
    }
}

impl<F: AssetFetcher, A: Authenticator> Mirror<F, A> {
    pub fn with_parts(options: MirrorOptions, fetcher: F, authenticator: A) -> Self {
        let (phase, _) = watch::channel(MirrorPhase::Idle);
        Self {
            options,
            fetcher: Arc::new(fetcher),
            authenticator,
            cancel: CancellationToken::new(),
            phase,
        }
    }

    pub fn options(&self) -> &MirrorOptions {
        &self.options
    }

    /// Cancelling stops pending and in-flight asset fetches; the run then
    /// ends with [`MirrorError::Cancelled`].
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn phase(&self) -> MirrorPhase {
        *self.phase.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<MirrorPhase> {
        self.phase.subscribe()
    }

    fn enter(&self, phase: MirrorPhase) {
        debug!(?phase, "entering phase");
        self.phase.send_replace(phase);
    }

    fn fail(&self, err: MirrorError) -> MirrorError {
        warn!(error = %err, "mirror failed");
        self.enter(MirrorPhase::Failed);
        err
    }

    pub async fn run(
        &self,
        target: &MirrorTarget,
        credentials: Option<&Credentials>,
    ) -> Result<MirrorSummary, MirrorError> {
        let started = Instant::now();
        info!(url = %target.root_url, output = %target.output_root.display(), "starting mirror");

        let mut cookies = self.options.cookies.clone();
        if let Some(credentials) = credentials {
            let login = self
                .authenticator
                .authenticate(credentials)
                .await
                .map_err(|e| self.fail(e.into()))?;
            cookies.extend(login);
        }

        let session = SessionContext::new(
            &target.root_url,
            &cookies,
            &self.options.user_agent,
            self.options.timeout,
        )
        .map_err(|e| self.fail(MirrorError::Client(e)))?;

        let files = FileManager::new(&target.output_root).map_err(|source| {
            self.fail(MirrorError::OutputRoot {
                path: target.output_root.clone(),
                source,
            })
        })?;

        self.enter(MirrorPhase::FetchingRoot);
        let fetched = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(FetchError::Cancelled),
            outcome = self.fetcher.fetch(&target.root_url, &session) => outcome,
        };
        let root = match fetched {
            Ok(root) => root,
            Err(FetchError::Cancelled) => return Err(self.fail(MirrorError::Cancelled)),
            Err(source) => {
                return Err(self.fail(MirrorError::RootFetch {
                    url: target.root_url.clone(),
                    source,
                }))
            }
        };
        let decoded = charset::decode(&root.bytes, root.content_type.as_deref());
        info!(
            url = %root.final_url,
            bytes = root.bytes.len(),
            encoding = decoded.encoding.name(),
            "root document fetched"
        );

        self.enter(MirrorPhase::Scanning);
        let plan = plan_assets(&decoded.text, &root.final_url);
        info!(
            assets = plan.assets.len(),
            parse_warnings = plan.parse_warnings,
            base = %plan.base_url,
            "scan complete"
        );

        self.enter(MirrorPhase::FetchingAssets);
        let total_assets = plan.assets.len();
        let mut reports = self.fetch_assets(plan.assets, &session, &files).await;
        if self.cancel.is_cancelled() {
            return Err(self.fail(MirrorError::Cancelled));
        }
        reports.sort_by_key(|r| r.index);

        self.enter(MirrorPhase::Rewriting);
        let root_document = files.root_document_path();
        let mut replacements = HashMap::with_capacity(reports.len());
        for report in &reports {
            let target_href = match &report.result {
                Ok(path) => relative_href(&root_document, path),
                Err(_) => None,
            };
            // Failed assets point at the network so the page still renders them.
            let href = target_href.unwrap_or_else(|| report.url.to_string());
            replacements.insert(report.url.clone(), href);
        }
        let document = match rewrite(&decoded.text, &plan.base_url, &replacements) {
            Ok(rewritten) => {
                debug!(replaced = rewritten.replaced, "root document rewritten");
                charset::encode(&rewritten.html, decoded.encoding)
            }
            Err(e) => {
                warn!(error = %e, "rewrite failed, keeping original markup");
                root.bytes
            }
        };

        self.enter(MirrorPhase::WritingRoot);
        files
            .save_root_document(&document)
            .map_err(|e| self.fail(MirrorError::RootWrite(e)))?;

        let mut by_category = BTreeMap::new();
        let mut failures = Vec::new();
        for report in &reports {
            match &report.result {
                Ok(_) => *by_category.entry(report.local.category()).or_insert(0) += 1,
                Err(e) => failures.push(AssetFailure {
                    url: report.url.to_string(),
                    code: e.code(),
                    reason: e.to_string(),
                }),
            }
        }
        let succeeded = by_category.values().sum();

        let archive = if self.options.archive {
            self.enter(MirrorPhase::Archiving);
            self.archive(files.base_dir()).await
        } else {
            None
        };

        let summary = MirrorSummary {
            root_url: target.root_url.to_string(),
            output_root: target.output_root.clone(),
            total_assets,
            succeeded,
            failed: total_assets - succeeded,
            elapsed: started.elapsed(),
            by_category,
            failures,
            parse_warnings: plan.parse_warnings,
            archive,
        };
        info!(
            total = summary.total_assets,
            succeeded = summary.succeeded,
            failed = summary.failed,
            "mirror complete"
        );
        self.enter(MirrorPhase::Done);
        Ok(summary)
    }

    /// Fans the assets out over a bounded task set and waits for all of them.
    async fn fetch_assets(
        &self,
        planned: Vec<PlannedAsset>,
        session: &SessionContext,
        files: &FileManager,
    ) -> Vec<AssetReport> {
        let total = planned.len();
        let semaphore = Arc::new(Semaphore::new(self.options.max_concurrent.max(1)));
        let progress = self.progress_bar(total);
        let mut tasks = JoinSet::new();

        for asset in planned {
            let fetcher = Arc::clone(&self.fetcher);
            let semaphore = Arc::clone(&semaphore);
            let session = session.clone();
            let files = files.clone();
            let cancel = self.cancel.clone();

            tasks.spawn(async move {
                let permit = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    permit = semaphore.acquire_owned() => permit.ok(),
                };
                let url = asset.reference.resolved_url.clone();
                let outcome = if permit.is_none() {
                    Err(FetchError::Cancelled)
                } else {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => Err(FetchError::Cancelled),
                        outcome = fetcher.fetch(&url, &session) => outcome,
                    }
                };
                let fetched = FetchResult {
                    asset: asset.reference,
                    outcome,
                };
                let result = persist(&files, &asset.local, fetched);
                drop(permit);
                AssetReport {
                    index: asset.index,
                    url,
                    local: asset.local,
                    result,
                }
            });
        }

        let mut reports = Vec::with_capacity(total);
        while let Some(joined) = tasks.join_next().await {
            progress.inc(1);
            match joined {
                Ok(report) => {
                    if let Err(e) = &report.result {
                        warn!(url = %report.url, error = %e, "asset failed");
                    }
                    progress.set_message(report.url.to_string());
                    reports.push(report);
                }
                Err(e) => warn!(error = %e, "asset task aborted"),
            }
        }
        progress.finish_and_clear();
        reports
    }

    async fn archive(&self, dir: &Path) -> Option<PathBuf> {
        let dir = dir.to_path_buf();
        match tokio::task::spawn_blocking(move || zip_directory(&dir)).await {
            Ok(Ok(path)) => Some(path),
            Ok(Err(e)) => {
                warn!(error = %e, "archiving failed");
                None
            }
            Err(e) => {
                warn!(error = %e, "archive task aborted");
                None
            }
        }
    }

    fn progress_bar(&self, len: usize) -> ProgressBar {
        if !self.options.show_progress {
            return ProgressBar::hidden();
        }
        let bar = ProgressBar::new(len as u64);
        bar.set_style(
            ProgressStyle::with_template("{spinner} [{bar:30}] {pos}/{len} {wide_msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );
        bar
    }
}

/// Hands a fetch result to the writer.
fn persist(
    files: &FileManager,
    local: &LocalPath,
    fetched: FetchResult,
) -> Result<PathBuf, AssetError> {
    let body = fetched.outcome?;
    debug!(url = %fetched.asset.resolved_url, path = %local, "writing asset");
    Ok(files.save_file(local, &body.bytes)?)
}

/// Unique assets of a page and the base their references resolved against.
struct Plan {
    assets: Vec<PlannedAsset>,
    base_url: Url,
    parse_warnings: usize,
}

/// Scans the page and keeps the first reference to each mappable URL.
fn plan_assets(html: &str, page_url: &Url) -> Plan {
    let document = HtmlParser::new(page_url.clone()).parse(html);
    let mut seen = HashSet::new();
    let mut assets = Vec::new();

    for reference in document.references() {
        if !seen.insert(reference.resolved_url.clone()) {
            continue;
        }
        match map_url(&reference.resolved_url) {
            Ok(local) => assets.push(PlannedAsset {
                index: assets.len(),
                reference,
                local,
            }),
            Err(e) => warn!(url = %reference.resolved_url, error = %e, "skipping unmappable asset"),
        }
    }
    Plan {
        assets,
        base_url: document.base_url().clone(),
        parse_warnings: document.warnings().len(),
    }
}
