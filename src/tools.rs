use std::{
    collections::{BTreeMap, HashMap},
    fs::File,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use zip::ZipArchive;

use crate::{
    process::ProcessRunner,
    util::{self, DownloadError, HttpClient},
};

const VERSIONS_FILE_NAME: &str = "tools.json";
const UNKNOWN_VERSION: &str = "unknown";

const YTDLP_RELEASE_URL: &str = "https://github.com/yt-dlp/yt-dlp/releases/latest/download";
const FFMPEG_BUILDS_URL: &str = "https://www.gyan.dev/ffmpeg/builds";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ToolKind {
    YtDlp,
    Ffmpeg,
}

impl ToolKind {
    pub fn name(self) -> &'static str {
        match self {
            ToolKind::YtDlp => "yt-dlp",
            ToolKind::Ffmpeg => "ffmpeg",
        }
    }

    pub fn executable_name(self) -> String {
        platform_bin(self.name())
    }

    /// Release asset downloaded on this platform.
    pub fn asset_name(self) -> Option<&'static str> {
        match self {
            ToolKind::YtDlp if cfg!(target_os = "windows") => Some("yt-dlp.exe"),
            ToolKind::YtDlp if cfg!(target_os = "macos") => Some("yt-dlp_macos"),
            ToolKind::YtDlp if cfg!(all(target_os = "linux", target_arch = "aarch64")) => {
                Some("yt-dlp_linux_aarch64")
            }
            ToolKind::YtDlp if cfg!(target_os = "linux") => Some("yt-dlp_linux"),
            ToolKind::Ffmpeg if cfg!(target_os = "windows") => Some("ffmpeg-release-essentials.zip"),
            _ => None,
        }
    }

    /// Where the tool is fetched from on this platform.
    pub fn download_url(self) -> Option<String> {
        let asset = self.asset_name()?;
        Some(match self {
            ToolKind::YtDlp => format!("{}/{}", YTDLP_RELEASE_URL, asset),
            ToolKind::Ffmpeg => format!("{}/{}", FFMPEG_BUILDS_URL, asset),
        })
    }

    /// Published SHA-256 for the download. yt-dlp lists every asset in one
    /// manifest, the ffmpeg builds ship a `.sha256` next to the archive.
    pub fn checksum_url(self) -> Option<String> {
        match self {
            ToolKind::YtDlp => self
                .asset_name()
                .map(|_| format!("{}/SHA2-256SUMS", YTDLP_RELEASE_URL)),
            ToolKind::Ffmpeg => self.download_url().map(|url| format!("{}.sha256", url)),
        }
    }

    fn version_arg(self) -> &'static str {
        match self {
            ToolKind::YtDlp => "--version",
            ToolKind::Ffmpeg => "-version",
        }
    }

    fn is_archive(self) -> bool {
        matches!(self, ToolKind::Ffmpeg)
    }
}

pub fn platform_bin(name: &str) -> String {
    if cfg!(target_os = "windows") {
        format!("{}.exe", name)
    } else {
        name.to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolVersionInfo {
    pub version: String,
    pub file_path: PathBuf,
    pub downloaded_at: DateTime<Utc>,
}

impl ToolVersionInfo {
    pub fn is_stale(&self, now: DateTime<Utc>, max_age: chrono::Duration) -> bool {
        now - self.downloaded_at > max_age
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ToolError {
    #[error("{0} cannot be downloaded on this platform")]
    UnsupportedPlatform(&'static str),
    #[error("Download was cancelled")]
    Cancelled,
    #[error("Download failed: {0}")]
    Download(#[from] DownloadError),
    #[error("Could not read archive: {0}")]
    Archive(#[from] zip::result::ZipError),
    #[error("{0} not found in archive")]
    MissingPayload(String),
    #[error("No published checksum for {0}")]
    MissingChecksum(String),
    #[error("Checksum mismatch for {asset}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        asset: String,
        expected: String,
        actual: String,
    },
    #[error("Could not parse version file")]
    Parse(#[from] serde_json::Error),
    #[error("I/O error")]
    IoError(#[from] std::io::Error),
    #[error("Background task failed")]
    Join(#[from] tokio::task::JoinError),
}

/// Source of tool binaries.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Writes the body of `url` to `dest`, returning the number of bytes.
    async fn fetch(&self, url: &str, dest: &Path) -> Result<u64, DownloadError>;

    /// Small text bodies such as checksum manifests.
    async fn fetch_text(&self, url: &str) -> Result<String, DownloadError>;
}

#[async_trait]
impl Fetcher for HttpClient {
    async fn fetch(&self, url: &str, dest: &Path) -> Result<u64, DownloadError> {
        self.download_file(url, dest).await
    }

    async fn fetch_text(&self, url: &str) -> Result<String, DownloadError> {
        HttpClient::fetch_text(self, url).await
    }
}

/// Finds, downloads and tracks the external binaries.
pub struct ToolManager {
    tools_dir: PathBuf,
    fetcher: Arc<dyn Fetcher>,
    runner: ProcessRunner,
    overrides: HashMap<ToolKind, PathBuf>,
    use_system_path: bool,
    stale_after: chrono::Duration,
    probe_timeout: Duration,
    ytdlp_lock: Mutex<()>,
    ffmpeg_lock: Mutex<()>,
    versions_lock: Mutex<()>,
}

impl ToolManager {
    pub fn new(tools_dir: impl Into<PathBuf>, fetcher: Arc<dyn Fetcher>, runner: ProcessRunner) -> Self {
        Self {
            tools_dir: tools_dir.into(),
            fetcher,
            runner,
            overrides: HashMap::new(),
            use_system_path: true,
            stale_after: chrono::Duration::days(7),
            probe_timeout: Duration::from_secs(15),
            ytdlp_lock: Mutex::new(()),
            ffmpeg_lock: Mutex::new(()),
            versions_lock: Mutex::new(()),
        }
    }

    /// Always use `path` for `kind`, if it exists.
    pub fn with_override(mut self, kind: ToolKind, path: impl Into<PathBuf>) -> Self {
        self.overrides.insert(kind, path.into());
        self
    }

    pub fn with_system_path(mut self, enabled: bool) -> Self {
        self.use_system_path = enabled;
        self
    }

    pub fn with_stale_after(mut self, max_age: chrono::Duration) -> Self {
        self.stale_after = max_age;
        self
    }

    pub fn tools_dir(&self) -> &Path {
        &self.tools_dir
    }

    pub fn managed_path(&self, kind: ToolKind) -> PathBuf {
        self.tools_dir.join(kind.executable_name())
    }

    fn versions_path(&self) -> PathBuf {
        self.tools_dir.join(VERSIONS_FILE_NAME)
    }

    fn lock_for(&self, kind: ToolKind) -> &Mutex<()> {
        match kind {
            ToolKind::YtDlp => &self.ytdlp_lock,
            ToolKind::Ffmpeg => &self.ffmpeg_lock,
        }
    }

    /// Looks for an existing binary: override, managed copy, then `PATH`.
    pub fn locate(&self, kind: ToolKind) -> Option<PathBuf> {
        if let Some(path) = self.overrides.get(&kind) {
            if path.is_file() {
                return Some(path.clone());
            }
            warn!(
                "Configured {} {} does not exist, looking elsewhere",
                kind.name(),
                path.display()
            );
        }

        let managed = self.managed_path(kind);
        if managed.is_file() {
            return Some(managed);
        }

        if self.use_system_path {
            return which::which(kind.name()).ok();
        }

        None
    }

    /// Returns a usable binary for `kind`, downloading it when none exists.
    /// Concurrent callers for the same tool share one download.
    pub async fn ensure(&self, kind: ToolKind, cancel: &CancellationToken) -> Result<PathBuf, ToolError> {
        let _guard = self.lock_for(kind).lock().await;

        if let Some(path) = self.locate(kind) {
            debug!("Using {} at {}", kind.name(), path.display());
            return Ok(path);
        }

        self.install(kind, cancel).await
    }

    /// Re-downloads the managed copy of `kind` when it is older than the
    /// staleness window. Overridden and system binaries are left alone.
    pub async fn refresh_if_stale(&self, kind: ToolKind, cancel: &CancellationToken) -> Result<PathBuf, ToolError> {
        let _guard = self.lock_for(kind).lock().await;

        let managed = self.managed_path(kind);
        match self.locate(kind) {
            Some(path) if path != managed => return Ok(path),
            Some(path) => {
                let fresh = self
                    .version_info(kind)
                    .await?
                    .map(|info| !info.is_stale(Utc::now(), self.stale_after))
                    .unwrap_or(false);
                if fresh {
                    return Ok(path);
                }
                info!("{} is stale, downloading again", kind.name());
            }
            None => (),
        }

        self.install(kind, cancel).await
    }

    pub async fn version_info(&self, kind: ToolKind) -> Result<Option<ToolVersionInfo>, ToolError> {
        let _guard = self.versions_lock.lock().await;
        Ok(self.read_versions().await?.remove(kind.name()))
    }

    async fn read_versions(&self) -> Result<BTreeMap<String, ToolVersionInfo>, ToolError> {
        match tokio::fs::read_to_string(self.versions_path()).await {
            Ok(text) => Ok(serde_json::from_str(&text)?),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn record_version(&self, kind: ToolKind, info: ToolVersionInfo) -> Result<(), ToolError> {
        let _guard = self.versions_lock.lock().await;
        let mut versions = self.read_versions().await?;
        versions.insert(kind.name().to_string(), info);

        let path = self.versions_path();
        let temp_path = util::tmp_sibling(&path);
        tokio::fs::write(&temp_path, serde_json::to_string_pretty(&versions)?).await?;
        tokio::fs::rename(&temp_path, &path).await?;
        Ok(())
    }

    async fn install(&self, kind: ToolKind, cancel: &CancellationToken) -> Result<PathBuf, ToolError> {
        let (Some(asset), Some(url), Some(checksum_url)) =
            (kind.asset_name(), kind.download_url(), kind.checksum_url())
        else {
            return Err(ToolError::UnsupportedPlatform(kind.name()));
        };

        tokio::fs::create_dir_all(&self.tools_dir).await?;
        let target = self.managed_path(kind);
        let download_path = self.tools_dir.join(format!("{}.download", kind.name()));

        info!("Downloading {} from {}", kind.name(), url);
        let fetched = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ToolError::Cancelled),
            res = self.fetch_verified(asset, &url, &checksum_url, &download_path) => res,
        };
        let size = match fetched {
            Ok(size) => size,
            Err(e) => {
                remove_quietly(&download_path).await;
                remove_quietly(&util::tmp_sibling(&download_path)).await;
                return Err(e);
            }
        };
        info!("Downloaded {} ({})", kind.name(), util::format_bytes(size));

        if kind.is_archive() {
            let archive = download_path.clone();
            let dest = self.tools_dir.clone();
            let extracted =
                tokio::task::spawn_blocking(move || extract_ffmpeg_archive(&archive, &dest)).await?;
            remove_quietly(&download_path).await;
            for path in extracted? {
                make_executable(&path).await?;
            }
        } else {
            make_executable(&download_path).await?;
            tokio::fs::rename(&download_path, &target).await?;
        }

        let version = self.probe_version(kind, &target, cancel).await;
        info!("Installed {} {} at {}", kind.name(), version, target.display());
        self.record_version(
            kind,
            ToolVersionInfo {
                version,
                file_path: target.clone(),
                downloaded_at: Utc::now(),
            },
        )
        .await?;

        Ok(target)
    }

    /// Downloads `url` to `dest` and checks it against the published SHA-256.
    async fn fetch_verified(
        &self,
        asset: &str,
        url: &str,
        checksum_url: &str,
        dest: &Path,
    ) -> Result<u64, ToolError> {
        let published = self.fetcher.fetch_text(checksum_url).await?;
        let expected = parse_checksum(&published, asset)
            .ok_or_else(|| ToolError::MissingChecksum(asset.to_string()))?;

        let size = self.fetcher.fetch(url, dest).await?;

        let path = dest.to_path_buf();
        let actual = tokio::task::spawn_blocking(move || sha256_of_file(&path)).await??;
        if actual != expected {
            return Err(ToolError::ChecksumMismatch {
                asset: asset.to_string(),
                expected,
                actual,
            });
        }
        debug!("{} matches sha256 {}", asset, actual);

        Ok(size)
    }

    async fn probe_version(&self, kind: ToolKind, path: &Path, cancel: &CancellationToken) -> String {
        let result = self
            .runner
            .run_checked(path, [kind.version_arg()], self.probe_timeout, cancel)
            .await;

        match result {
            Ok(result) => result
                .stdout_lines()
                .next()
                .map(|line| parse_version(kind, line))
                .unwrap_or_else(|| UNKNOWN_VERSION.to_string()),
            Err(e) => {
                warn!("Could not determine {} version: {}", kind.name(), e);
                UNKNOWN_VERSION.to_string()
            }
        }
    }
}

/// `ffmpeg version 7.0.1-essentials_build Copyright ...` -> `7.0.1-essentials_build`
fn parse_version(kind: ToolKind, line: &str) -> String {
    match kind {
        ToolKind::YtDlp => line.trim().to_string(),
        ToolKind::Ffmpeg => line
            .trim()
            .strip_prefix("ffmpeg version")
            .and_then(|rest| rest.split_whitespace().next())
            .unwrap_or(line.trim())
            .to_string(),
    }
}

/// Finds the hash for `asset` in a `sha256sum`-style manifest. A bare hash
/// with no file name, as in a single `.sha256` file, matches any asset.
pub fn parse_checksum(manifest: &str, asset: &str) -> Option<String> {
    let is_hash = |token: &str| token.len() == 64 && token.chars().all(|c| c.is_ascii_hexdigit());

    manifest.lines().find_map(|line| {
        let mut parts = line.split_whitespace();
        let hash = parts.next().filter(|token| is_hash(token))?;
        match parts.next().map(|name| name.trim_start_matches('*').trim_start_matches("./")) {
            Some(name) if !name.eq_ignore_ascii_case(asset) => None,
            _ => Some(hash.to_ascii_lowercase()),
        }
    })
}

fn sha256_of_file(path: &Path) -> std::io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher)?;
    Ok(format!("{:x}", hasher.finalize()))
}

/// Pulls `bin/ffmpeg` and `bin/ffprobe` out of a release archive into `dest`.
/// ffprobe is optional; ffmpeg is not.
pub fn extract_ffmpeg_archive(archive_path: &Path, dest: &Path) -> Result<Vec<PathBuf>, ToolError> {
    let mut archive = ZipArchive::new(File::open(archive_path)?)?;
    let wanted = [platform_bin("ffmpeg"), platform_bin("ffprobe")];
    let mut extracted = Vec::new();

    for index in 0..archive.len() {
        let mut entry = archive.by_index(index)?;
        if !entry.is_file() {
            continue;
        }

        let name = entry.name().replace('\\', "/").to_lowercase();
        let Some(bin) = wanted
            .iter()
            .find(|bin| name.ends_with(&format!("/bin/{}", bin)))
        else {
            continue;
        };

        let out_path = dest.join(bin);
        let temp_path = util::tmp_sibling(&out_path);
        let mut output = File::create(&temp_path)?;
        std::io::copy(&mut entry, &mut output)?;
        drop(output);
        std::fs::rename(&temp_path, &out_path)?;
        debug!("Extracted {}", out_path.display());
        extracted.push(out_path);
    }

    let ffmpeg = dest.join(&wanted[0]);
    if !extracted.contains(&ffmpeg) {
        return Err(ToolError::MissingPayload(wanted[0].clone()));
    }
    if extracted.len() < wanted.len() {
        warn!("{} not found in ffmpeg archive", wanted[1]);
    }

    Ok(extracted)
}

#[cfg(unix)]
async fn make_executable(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).await
}

#[cfg(not(unix))]
async fn make_executable(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

async fn remove_quietly(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != ErrorKind::NotFound {
            warn!("Could not remove {}: {}", path.display(), e);
        }
    }
}
