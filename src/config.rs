use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::command::ResolverSettings;

pub const CONFIG_ENV: &str = "YTPLAY_CONFIG";
pub const DATA_DIR_ENV: &str = "YTPLAY_DATA_DIR";
pub const YTDLP_ENV: &str = "YTPLAY_YTDLP";
pub const FFMPEG_ENV: &str = "YTPLAY_FFMPEG";
pub const TIMEOUT_ENV: &str = "YTPLAY_TIMEOUT_SECS";

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("I/O error")]
    IoError(#[from] std::io::Error),
    #[error("Could not parse config file: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    pub data_dir: PathBuf,
    pub cache_file: Option<PathBuf>,
    pub tools_dir: Option<PathBuf>,
    pub ytdlp_path: Option<PathBuf>,
    pub ffmpeg_path: Option<PathBuf>,
    pub process_timeout_secs: u64,
    pub conversion_timeout_secs: u64,
    pub default_ttl_secs: i64,
    pub conversion_capacity: usize,
    pub tool_stale_days: i64,
    pub settings: ResolverSettings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            cache_file: None,
            tools_dir: None,
            ytdlp_path: None,
            ffmpeg_path: None,
            process_timeout_secs: 30,
            conversion_timeout_secs: 600,
            default_ttl_secs: 4 * 60 * 60,
            conversion_capacity: 1,
            tool_stale_days: 7,
            settings: ResolverSettings::default(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    let base = if cfg!(target_os = "windows") {
        std::env::var_os("LOCALAPPDATA").map(PathBuf::from)
    } else {
        std::env::var_os("XDG_DATA_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|home| Path::new(&home).join(".local/share")))
    };

    base.unwrap_or_else(std::env::temp_dir).join("ytplay-rs")
}

impl Config {
    /// Reads `path` (a missing file gives the defaults) and applies
    /// environment overrides.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::read(path)?;
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Loads the file named by `YTPLAY_CONFIG`, defaulting to
    /// `<data dir>/config.json`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let path = std::env::var_os(CONFIG_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| default_data_dir().join("config.json"));
        Self::load(&path)
    }

    fn read(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(text) => {
                debug!("Loading config from {}", path.display());
                Ok(serde_json::from_str(&text)?)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let lookup = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(dir) = lookup(DATA_DIR_ENV) {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(path) = lookup(YTDLP_ENV) {
            self.ytdlp_path = Some(PathBuf::from(path));
        }
        if let Some(path) = lookup(FFMPEG_ENV) {
            self.ffmpeg_path = Some(PathBuf::from(path));
        }
        if let Some(secs) = lookup(TIMEOUT_ENV) {
            match secs.trim().parse() {
                Ok(secs) => self.process_timeout_secs = secs,
                Err(_) => warn!("Ignoring {}={:?}, not a number", TIMEOUT_ENV, secs),
            }
        }
    }

    pub fn cache_file(&self) -> PathBuf {
        self.cache_file
            .clone()
            .unwrap_or_else(|| self.data_dir.join("url-cache.json"))
    }

    pub fn tools_dir(&self) -> PathBuf {
        self.tools_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("tools"))
    }

    pub fn conversion_dir(&self) -> PathBuf {
        self.data_dir.join("converted")
    }

    pub fn process_timeout(&self) -> Duration {
        Duration::from_secs(self.process_timeout_secs)
    }

    pub fn conversion_timeout(&self) -> Duration {
        Duration::from_secs(self.conversion_timeout_secs)
    }

    pub fn default_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.default_ttl_secs)
    }

    pub fn tool_stale_after(&self) -> chrono::Duration {
        chrono::Duration::days(self.tool_stale_days)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use crate::command::{Browser, PlaylistMode, VideoQuality};

    use super::*;

    #[test]
    fn defaults() {
        let config = Config {
            data_dir: PathBuf::from("/data"),
            ..Config::default()
        };

        assert_eq!(config.cache_file(), PathBuf::from("/data/url-cache.json"));
        assert_eq!(config.tools_dir(), PathBuf::from("/data/tools"));
        assert_eq!(config.conversion_dir(), PathBuf::from("/data/converted"));
        assert_eq!(config.process_timeout(), Duration::from_secs(30));
        assert_eq!(config.default_ttl(), chrono::Duration::hours(4));
        assert_eq!(config.tool_stale_after(), chrono::Duration::days(7));
        assert_eq!(config.conversion_capacity, 1);
    }

    #[test]
    fn partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{
                "dataDir": "/srv/ytplay",
                "processTimeoutSecs": 45,
                "settings": {
                    "quality": "720p",
                    "cookiesFromBrowser": "firefox",
                    "playlistMode": "firstEntry",
                    "customArgs": ["socket-timeout=10"]
                }
            }"#,
        )
        .unwrap();

        let config = Config::read(&path).unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/srv/ytplay"));
        assert_eq!(config.process_timeout_secs, 45);
        assert_eq!(config.conversion_timeout_secs, 600);
        assert_eq!(config.settings.quality, VideoQuality::P720);
        assert_eq!(config.settings.cookies_from_browser, Some(Browser::Firefox));
        assert_eq!(config.settings.playlist_mode, PlaylistMode::FirstEntry);
        assert_eq!(config.settings.custom_args, vec!["socket-timeout=10"]);
    }

    #[test]
    fn missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::read(&dir.path().join("nope.json")).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn bad_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"processTimeoutSecs": "soon"}"#).unwrap();
        assert!(matches!(Config::read(&path), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn env_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            (DATA_DIR_ENV, "/tmp/yt"),
            (YTDLP_ENV, "/usr/local/bin/yt-dlp"),
            (FFMPEG_ENV, "  "),
            (TIMEOUT_ENV, "90"),
        ]);

        let mut config = Config::default();
        config.apply_overrides(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.data_dir, PathBuf::from("/tmp/yt"));
        assert_eq!(config.ytdlp_path, Some(PathBuf::from("/usr/local/bin/yt-dlp")));
        assert_eq!(config.ffmpeg_path, None);
        assert_eq!(config.process_timeout_secs, 90);

        config.apply_overrides(|key| (key == TIMEOUT_ENV).then(|| "forever".to_string()));
        assert_eq!(config.process_timeout_secs, 90);
    }
}
