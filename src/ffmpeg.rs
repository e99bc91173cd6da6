use std::{
    collections::hash_map::DefaultHasher,
    hash::{Hash, Hasher},
    io::ErrorKind,
    path::{Path, PathBuf},
    time::Duration,
};

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::{
    command::{self, TimeRange},
    process::{ProcessError, ProcessRunner},
};

#[derive(thiserror::Error, Debug)]
pub enum ConvertError {
    #[error("No source URL given")]
    InvalidSource,
    #[error("ffmpeg failed")]
    Process(#[from] ProcessError),
    #[error("I/O error")]
    IoError(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConversionRequest {
    pub source_url: String,
    /// Separate audio stream to mux in, for video-only sources.
    pub audio_url: Option<String>,
    /// Subtitle file burned into the picture.
    pub subtitle_path: Option<PathBuf>,
    pub time_range: Option<TimeRange>,
}

impl ConversionRequest {
    pub fn new(source_url: impl Into<String>) -> Self {
        Self {
            source_url: source_url.into(),
            audio_url: None,
            subtitle_path: None,
            time_range: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversionCacheEntry {
    pub output_file_path: PathBuf,
    pub created_at: DateTime<Utc>,
}

/// Bounded map from source URL to a converted file on disk. Evicted entries
/// take their file with them.
#[derive(Debug)]
pub struct ConversionCache {
    capacity: usize,
    entries: Vec<(String, ConversionCacheEntry)>,
}

impl ConversionCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: Vec::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, source_url: &str) -> Option<&ConversionCacheEntry> {
        self.entries
            .iter()
            .find(|(key, _)| key == source_url)
            .map(|(_, entry)| entry)
    }

    /// Adds an entry and evicts the oldest others until within capacity.
    /// Returns the paths of evicted files.
    pub fn insert(&mut self, source_url: impl Into<String>, entry: ConversionCacheEntry) -> Vec<PathBuf> {
        let source_url = source_url.into();
        let mut evicted = Vec::new();

        if let Some(pos) = self.entries.iter().position(|(key, _)| *key == source_url) {
            let (_, old) = self.entries.remove(pos);
            if old.output_file_path != entry.output_file_path {
                delete_file(&old.output_file_path);
                evicted.push(old.output_file_path);
            }
        }

        while self.entries.len() >= self.capacity {
            match self.evict_oldest() {
                Some(path) => evicted.push(path),
                None => break,
            }
        }

        self.entries.push((source_url, entry));
        evicted
    }

    /// Makes room for one more entry ahead of a conversion.
    pub fn evict_to_fit(&mut self) -> Vec<PathBuf> {
        let mut evicted = Vec::new();
        while self.entries.len() >= self.capacity {
            match self.evict_oldest() {
                Some(path) => evicted.push(path),
                None => break,
            }
        }
        evicted
    }

    pub fn remove(&mut self, source_url: &str) -> Option<ConversionCacheEntry> {
        let pos = self.entries.iter().position(|(key, _)| key == source_url)?;
        Some(self.entries.remove(pos).1)
    }

    pub fn clear(&mut self) {
        for (_, entry) in self.entries.drain(..) {
            delete_file(&entry.output_file_path);
        }
    }

    fn evict_oldest(&mut self) -> Option<PathBuf> {
        let pos = self
            .entries
            .iter()
            .enumerate()
            .min_by_key(|(_, (_, entry))| entry.created_at)
            .map(|(pos, _)| pos)?;

        let (key, entry) = self.entries.remove(pos);
        debug!("Evicting conversion of {}", key);
        delete_file(&entry.output_file_path);
        Some(entry.output_file_path)
    }
}

fn delete_file(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => debug!("Deleted {}", path.display()),
        Err(e) if e.kind() == ErrorKind::NotFound => (),
        Err(e) => warn!("Could not delete {}: {}", path.display(), e),
    }
}

fn output_name(source_url: &str) -> String {
    let mut hasher = DefaultHasher::new();
    source_url.hash(&mut hasher);
    format!("converted-{:016x}.mp4", hasher.finish())
}

/// Converts remote streams into local MP4 files with ffmpeg, keeping the most
/// recent results around.
pub struct Mp4Converter {
    runner: ProcessRunner,
    ffmpeg: PathBuf,
    output_dir: PathBuf,
    timeout: Duration,
    cache: Mutex<ConversionCache>,
}

impl Mp4Converter {
    pub fn new(runner: ProcessRunner, ffmpeg: impl Into<PathBuf>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            runner,
            ffmpeg: ffmpeg.into(),
            output_dir: output_dir.into(),
            timeout: Duration::from_secs(600),
            cache: Mutex::new(ConversionCache::new(1)),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.cache = Mutex::new(ConversionCache::new(capacity));
        self
    }

    pub async fn convert(
        &self,
        request: &ConversionRequest,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, ConvertError> {
        let source = request.source_url.trim();
        if source.is_empty() {
            return Err(ConvertError::InvalidSource);
        }

        // Held for the whole conversion so capacity is never exceeded.
        let mut cache = self.cache.lock().await;

        if let Some(entry) = cache.get(source) {
            if tokio::fs::try_exists(&entry.output_file_path)
                .await
                .unwrap_or(false)
            {
                debug!("Reusing conversion {}", entry.output_file_path.display());
                return Ok(entry.output_file_path.clone());
            }
            cache.remove(source);
        }

        cache.evict_to_fit();
        tokio::fs::create_dir_all(&self.output_dir).await?;

        let output = self.output_dir.join(output_name(source));
        let args = command::conversion_args(request, &output);
        debug!(
            "Running {}",
            command::to_command_line(&self.ffmpeg.to_string_lossy(), &args)
        );

        if let Err(e) = self
            .runner
            .run_checked(&self.ffmpeg, &args, self.timeout, cancel)
            .await
        {
            delete_file(&output);
            return Err(e.into());
        }

        info!("Converted {} to {}", source, output.display());
        cache.insert(
            source,
            ConversionCacheEntry {
                output_file_path: output.clone(),
                created_at: Utc::now(),
            },
        );

        Ok(output)
    }

    /// Deletes every converted file.
    pub async fn clear(&self) {
        self.cache.lock().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration as ChronoDuration, TimeZone};

    use super::*;

    fn entry(path: PathBuf, minute: u32) -> ConversionCacheEntry {
        ConversionCacheEntry {
            output_file_path: path,
            created_at: Utc.with_ymd_and_hms(2030, 1, 1, 0, minute, 0).unwrap(),
        }
    }

    fn touch(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, b"mp4").unwrap();
        path
    }

    #[test]
    fn capacity_one_evicts_previous() {
        let dir = tempfile::tempdir().unwrap();
        let first = touch(dir.path(), "first.mp4");
        let second = touch(dir.path(), "second.mp4");

        let mut cache = ConversionCache::new(1);
        assert!(cache.insert("a", entry(first.clone(), 0)).is_empty());
        assert_eq!(cache.insert("b", entry(second.clone(), 1)), vec![first.clone()]);

        assert_eq!(cache.len(), 1);
        assert!(cache.get("a").is_none());
        assert!(cache.get("b").is_some());
        assert!(!first.exists());
        assert!(second.exists());
    }

    #[test]
    fn evicts_oldest_by_creation_time() {
        let dir = tempfile::tempdir().unwrap();
        let old = touch(dir.path(), "old.mp4");
        let mid = touch(dir.path(), "mid.mp4");
        let new = touch(dir.path(), "new.mp4");

        let mut cache = ConversionCache::new(2);
        cache.insert("mid", entry(mid.clone(), 5));
        cache.insert("old", entry(old.clone(), 1));
        assert_eq!(cache.insert("new", entry(new.clone(), 9)), vec![old.clone()]);

        assert!(!old.exists());
        assert!(mid.exists() && new.exists());
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn evict_to_fit_and_clear() {
        let dir = tempfile::tempdir().unwrap();
        let path = touch(dir.path(), "a.mp4");

        let mut cache = ConversionCache::new(0);
        assert_eq!(cache.capacity(), 1);
        cache.insert("a", entry(path.clone(), 0));
        assert_eq!(cache.evict_to_fit(), vec![path.clone()]);
        assert!(cache.is_empty());
        assert!(!path.exists());

        let other = touch(dir.path(), "b.mp4");
        cache.insert("b", entry(other.clone(), 1));
        cache.clear();
        assert!(cache.is_empty());
        assert!(!other.exists());
    }

    #[test]
    fn reinserting_same_source_replaces() {
        let dir = tempfile::tempdir().unwrap();
        let v1 = touch(dir.path(), "v1.mp4");
        let v2 = touch(dir.path(), "v2.mp4");

        let mut cache = ConversionCache::new(1);
        cache.insert("a", entry(v1.clone(), 0));
        let evicted = cache.insert(
            "a",
            ConversionCacheEntry {
                output_file_path: v2.clone(),
                created_at: Utc::now() + ChronoDuration::minutes(1),
            },
        );

        assert_eq!(evicted, vec![v1.clone()]);
        assert_eq!(cache.get("a").unwrap().output_file_path, v2);
    }

    #[test]
    fn output_names_are_stable() {
        assert_eq!(output_name("https://a"), output_name("https://a"));
        assert_ne!(output_name("https://a"), output_name("https://b"));
        assert!(output_name("https://a").ends_with(".mp4"));
    }

    #[tokio::test]
    async fn rejects_empty_source() {
        let dir = tempfile::tempdir().unwrap();
        let converter = Mp4Converter::new(ProcessRunner::new(), "ffmpeg", dir.path());
        let err = converter
            .convert(&ConversionRequest::new("  "), &CancellationToken::new())
            .await
            .expect_err("empty source");
        assert!(matches!(err, ConvertError::InvalidSource));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failed_conversion_is_not_cached() {
        let dir = tempfile::tempdir().unwrap();
        // `false` ignores its arguments and exits 1
        let converter = Mp4Converter::new(ProcessRunner::new(), "false", dir.path());
        let request = ConversionRequest::new("https://cdn.example/v.webm");

        let err = converter
            .convert(&request, &CancellationToken::new())
            .await
            .expect_err("conversion should fail");
        assert!(matches!(
            err,
            ConvertError::Process(ProcessError::Execution { exit_code: 1, .. })
        ));
        assert!(converter.cache.lock().await.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn reuses_existing_output() {
        let dir = tempfile::tempdir().unwrap();
        // `true` succeeds without writing anything; the test provides the file
        let converter = Mp4Converter::new(ProcessRunner::new(), "true", dir.path());
        let request = ConversionRequest::new("https://cdn.example/v.webm");
        let cancel = CancellationToken::new();

        let path = converter.convert(&request, &cancel).await.unwrap();
        std::fs::write(&path, b"mp4").unwrap();

        let other = ConversionRequest::new("https://cdn.example/other.webm");
        let other_path = converter.convert(&other, &cancel).await.unwrap();
        assert_ne!(path, other_path);
        assert!(!path.exists(), "previous output should be evicted");

        std::fs::write(&other_path, b"mp4").unwrap();
        assert_eq!(converter.convert(&other, &cancel).await.unwrap(), other_path);
    }
}
