use std::{path::PathBuf, time::Duration};

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::{
    cache::{CacheEntry, CacheError, UrlCache},
    command::{self, ResolverSettings},
    process::{ProcessError, ProcessResult, ProcessRunner},
    youtube,
};

/// Substrings yt-dlp prints when `-U` finds nothing newer. Some builds exit
/// non-zero in that case.
const UP_TO_DATE_MARKERS: &[&str] = &["is up to date", "already up to date", "is up-to-date"];

#[derive(thiserror::Error, Debug)]
pub enum ResolveError {
    #[error("Invalid URL: {0:?}")]
    InvalidUrl(String),
    #[error("yt-dlp error: {0}")]
    Tool(String),
    #[error(transparent)]
    Process(#[from] ProcessError),
    #[error("Cache error")]
    Cache(#[from] CacheError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateStatus {
    Updated,
    AlreadyUpToDate,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved {
    pub title: String,
    pub direct_url: String,
    pub expires_at: DateTime<Utc>,
    pub from_cache: bool,
}

impl Resolved {
    fn new(entry: &CacheEntry, from_cache: bool) -> Self {
        Self {
            title: entry.title.clone(),
            direct_url: entry.direct_url.clone(),
            expires_at: entry.expires_at,
            from_cache,
        }
    }
}

/// Turns page URLs into playable stream URLs through yt-dlp, remembering the
/// answers until they expire.
pub struct Resolver {
    runner: ProcessRunner,
    ytdlp: PathBuf,
    settings: ResolverSettings,
    cache: Mutex<UrlCache>,
    cache_file: Option<PathBuf>,
    timeout: Duration,
    default_ttl: chrono::Duration,
}

impl Resolver {
    pub fn new(runner: ProcessRunner, ytdlp: impl Into<PathBuf>, settings: ResolverSettings) -> Self {
        Self {
            runner,
            ytdlp: ytdlp.into(),
            settings,
            cache: Mutex::new(UrlCache::new()),
            cache_file: None,
            timeout: Duration::from_secs(30),
            default_ttl: chrono::Duration::hours(4),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_default_ttl(mut self, ttl: chrono::Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    pub fn with_cache(mut self, cache: UrlCache) -> Self {
        self.cache = Mutex::new(cache);
        self
    }

    /// File the cache is loaded from and persisted to.
    pub fn with_cache_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.cache_file = Some(path.into());
        self
    }

    pub fn settings(&self) -> &ResolverSettings {
        &self.settings
    }

    /// Merges the on-disk cache into memory. Returns the number of live
    /// entries afterwards.
    pub async fn load_cache(&self) -> Result<usize, ResolveError> {
        let mut cache = self.cache.lock().await;
        if let Some(path) = &self.cache_file {
            cache.merge(UrlCache::load(path, Utc::now()).await?);
        }
        Ok(cache.len())
    }

    /// Saves the cache. Call before the process exits.
    pub async fn persist(&self) -> Result<usize, ResolveError> {
        let Some(path) = &self.cache_file else {
            return Ok(0);
        };
        Ok(self.cache.lock().await.save(path, Utc::now()).await?)
    }

    pub async fn cached(&self, url: &str) -> Option<CacheEntry> {
        let key = youtube::cache_key(url);
        self.cache.lock().await.get(&key, Utc::now()).cloned()
    }

    pub async fn resolve(&self, url: &str, cancel: &CancellationToken) -> Result<Resolved, ResolveError> {
        let url = url.trim();
        if url.is_empty() {
            return Err(ResolveError::InvalidUrl(url.to_string()));
        }

        let key = youtube::cache_key(url);
        if let Some(entry) = self.cache.lock().await.get(&key, Utc::now()) {
            debug!("Cache hit for {}", key);
            return Ok(Resolved::new(entry, true));
        }

        let args = command::url_extraction_args(&self.settings, url);
        let result = self.run_ytdlp(&args, cancel).await?;
        let (title, direct_url) = parse_extraction_output(&result)?;
        validate_direct_url(&direct_url)?;

        let expires_at = youtube::expiry_or_default(&direct_url, Utc::now(), self.default_ttl);
        let entry = CacheEntry {
            direct_url,
            title,
            source_url: url.to_string(),
            expires_at,
        };
        info!("Resolved {} (valid until {})", key, expires_at);

        let resolved = Resolved::new(&entry, false);
        self.cache.lock().await.insert(key, entry);
        Ok(resolved)
    }

    pub async fn resolve_title(&self, url: &str, cancel: &CancellationToken) -> Result<String, ResolveError> {
        let url = url.trim();
        if url.is_empty() {
            return Err(ResolveError::InvalidUrl(url.to_string()));
        }

        if let Some(entry) = self.cached(url).await {
            return Ok(entry.title);
        }

        let args = command::title_extraction_args(&self.settings, url);
        let result = self.run_ytdlp(&args, cancel).await?;
        let title = result.stdout_lines().next().map(str::to_string);
        title.ok_or_else(|| ResolveError::Tool("yt-dlp printed no title".to_string()))
    }

    /// Runs the yt-dlp self-updater.
    pub async fn update_tool(&self, cancel: &CancellationToken) -> Result<UpdateStatus, ResolveError> {
        let args = command::update_args();
        debug!(
            "Running {}",
            command::to_command_line(&self.ytdlp.to_string_lossy(), &args)
        );
        let result = self
            .runner
            .run(&self.ytdlp, &args, self.timeout, cancel)
            .await?;

        let status = classify_update(&result);
        match status {
            UpdateStatus::Failed => warn!(
                "yt-dlp update failed with code {}: {}",
                result.exit_code,
                result.stderr.trim()
            ),
            _ => info!("yt-dlp update: {:?}", status),
        }
        Ok(status)
    }

    async fn run_ytdlp(&self, args: &[String], cancel: &CancellationToken) -> Result<ProcessResult, ResolveError> {
        debug!(
            "Running {}",
            command::to_command_line(&self.ytdlp.to_string_lossy(), args)
        );
        Ok(self
            .runner
            .run_checked(&self.ytdlp, args, self.timeout, cancel)
            .await?)
    }
}

/// First two non-empty lines: title, then direct URL.
pub fn parse_extraction_output(result: &ProcessResult) -> Result<(String, String), ResolveError> {
    let mut lines = result.stdout_lines();
    match (lines.next(), lines.next()) {
        (Some(title), Some(url)) => Ok((title.to_string(), url.to_string())),
        _ => Err(ResolveError::Tool(format!(
            "expected a title and a URL, got {:?}",
            result.stdout.trim()
        ))),
    }
}

pub fn validate_direct_url(direct_url: &str) -> Result<(), ResolveError> {
    match Url::parse(direct_url) {
        Ok(url) if url.has_host() => Ok(()),
        _ => Err(ResolveError::Tool(format!(
            "not an absolute URL: {:?}",
            direct_url
        ))),
    }
}

pub fn classify_update(result: &ProcessResult) -> UpdateStatus {
    let output = format!("{}\n{}", result.stdout, result.stderr).to_lowercase();

    if UP_TO_DATE_MARKERS.iter().any(|marker| output.contains(marker)) {
        UpdateStatus::AlreadyUpToDate
    } else if result.is_success() {
        UpdateStatus::Updated
    } else {
        UpdateStatus::Failed
    }
}
