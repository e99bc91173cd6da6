use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{ffmpeg::ConversionRequest, youtube};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum VideoQuality {
    #[default]
    #[serde(rename = "best")]
    Best,
    #[serde(rename = "1080p")]
    P1080,
    #[serde(rename = "720p")]
    P720,
    #[serde(rename = "480p")]
    P480,
    #[serde(rename = "360p")]
    P360,
    #[serde(rename = "audio")]
    AudioOnly,
}

impl VideoQuality {
    pub fn max_height(self) -> Option<u32> {
        match self {
            VideoQuality::P1080 => Some(1080),
            VideoQuality::P720 => Some(720),
            VideoQuality::P480 => Some(480),
            VideoQuality::P360 => Some(360),
            VideoQuality::Best | VideoQuality::AudioOnly => None,
        }
    }

    /// yt-dlp `-f` selector. Prefers progressive MP4 so the direct URL plays
    /// without a separate audio stream.
    pub fn format_selector(self) -> String {
        match (self, self.max_height()) {
            (VideoQuality::AudioOnly, _) => "bestaudio[ext=m4a]/bestaudio".to_string(),
            (_, Some(h)) => format!(
                "best[height<={h}][ext=mp4][vcodec!=none][acodec!=none]/best[height<={h}]/best"
            ),
            (_, None) => "best[ext=mp4][vcodec!=none][acodec!=none]/best".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Browser {
    Brave,
    Chrome,
    Chromium,
    Edge,
    Firefox,
    Opera,
    Safari,
    Vivaldi,
}

impl Browser {
    pub fn as_str(self) -> &'static str {
        match self {
            Browser::Brave => "brave",
            Browser::Chrome => "chrome",
            Browser::Chromium => "chromium",
            Browser::Edge => "edge",
            Browser::Firefox => "firefox",
            Browser::Opera => "opera",
            Browser::Safari => "safari",
            Browser::Vivaldi => "vivaldi",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PlaylistMode {
    /// Strip playlist parameters and only look at the video itself.
    #[default]
    SingleVideo,
    /// Treat the URL as a playlist and take its first entry.
    FirstEntry,
    /// Pass the URL through untouched.
    Allow,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeRange {
    pub start_secs: f64,
    pub end_secs: Option<f64>,
}

impl TimeRange {
    pub fn duration_secs(&self) -> Option<f64> {
        self.end_secs
            .map(|end| end - self.start_secs)
            .filter(|d| *d > 0.0)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ResolverSettings {
    pub quality: VideoQuality,
    pub cookies_from_browser: Option<Browser>,
    pub playlist_mode: PlaylistMode,
    pub time_range: Option<TimeRange>,
    /// `key=value` lines appended to every yt-dlp invocation.
    pub custom_args: Vec<String>,
}

fn cookie_args(settings: &ResolverSettings) -> Vec<String> {
    match settings.cookies_from_browser {
        Some(browser) => vec!["--cookies-from-browser".into(), browser.as_str().into()],
        None => Vec::new(),
    }
}

fn playlist_args(settings: &ResolverSettings) -> Vec<String> {
    match settings.playlist_mode {
        PlaylistMode::SingleVideo => vec!["--no-playlist".into()],
        PlaylistMode::FirstEntry => vec![
            "--yes-playlist".into(),
            "--playlist-items".into(),
            "1".into(),
        ],
        PlaylistMode::Allow => vec!["--yes-playlist".into()],
    }
}

fn target_url(settings: &ResolverSettings, url: &str) -> String {
    match settings.playlist_mode {
        PlaylistMode::SingleVideo => youtube::strip_playlist(url),
        _ => url.trim().to_string(),
    }
}

/// yt-dlp arguments that print the title followed by the direct URL.
pub fn url_extraction_args(settings: &ResolverSettings, url: &str) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "--no-warnings".into(),
        "--print".into(),
        "title".into(),
        "--print".into(),
        "urls".into(),
        "-f".into(),
        settings.quality.format_selector(),
    ];
    args.extend(cookie_args(settings));
    args.extend(playlist_args(settings));
    args.extend(custom_args(&settings.custom_args));
    args.push(target_url(settings, url));
    args
}

pub fn title_extraction_args(settings: &ResolverSettings, url: &str) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "--no-warnings".into(),
        "--skip-download".into(),
        "--print".into(),
        "title".into(),
    ];
    args.extend(cookie_args(settings));
    args.extend(playlist_args(settings));
    args.extend(custom_args(&settings.custom_args));
    args.push(target_url(settings, url));
    args
}

pub fn update_args() -> Vec<String> {
    vec!["-U".into()]
}

/// Turns `key=value` lines into flags. Blank lines and `#` comments are
/// skipped, a bare `key` becomes a switch, and keys that already start with
/// `-` are kept as written.
pub fn custom_args<S: AsRef<str>>(lines: &[S]) -> Vec<String> {
    let mut args = Vec::new();

    for line in lines {
        let line = line.as_ref().trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let (key, value) = match line.split_once('=') {
            Some((k, v)) => (k.trim(), Some(v.trim())),
            None => (line, None),
        };
        if key.is_empty() {
            continue;
        }

        if key.starts_with('-') {
            args.push(key.to_string());
        } else {
            args.push(format!("--{}", key));
        }
        if let Some(value) = value.filter(|v| !v.is_empty()) {
            args.push(value.to_string());
        }
    }

    args
}

fn format_secs(secs: f64) -> String {
    format!("{:.3}", secs)
}

/// Escapes a path for use inside an ffmpeg filter graph argument.
fn filter_path(path: &Path) -> String {
    path.to_string_lossy()
        .replace('\\', "/")
        .replace(':', "\\:")
        .replace('\'', "\\'")
}

/// ffmpeg arguments converting `request` into a web-friendly MP4 at `output`.
///
/// Without subtitles the trim is applied on the inputs so ffmpeg can seek
/// remotely. Burning subtitles needs the original timestamps, so the trim then
/// moves to the output side.
pub fn conversion_args(request: &ConversionRequest, output: &Path) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "-hide_banner".into(),
        "-loglevel".into(),
        "error".into(),
        "-y".into(),
    ];

    let input_seek = request
        .time_range
        .filter(|r| r.start_secs > 0.0 && request.subtitle_path.is_none());
    let output_trim = request
        .time_range
        .filter(|_| request.subtitle_path.is_some());

    let mut inputs = vec![request.source_url.as_str()];
    if let Some(audio) = &request.audio_url {
        inputs.push(audio.as_str());
    }
    for input in &inputs {
        if let Some(range) = input_seek {
            args.push("-ss".into());
            args.push(format_secs(range.start_secs));
        }
        args.push("-i".into());
        args.push(input.to_string());
    }

    if request.audio_url.is_some() {
        args.extend(["-map", "0:v:0", "-map", "1:a:0"].map(String::from));
    }

    match (input_seek, output_trim) {
        (Some(range), _) => {
            if let Some(duration) = range.duration_secs() {
                args.push("-t".into());
                args.push(format_secs(duration));
            }
        }
        (None, Some(range)) => {
            if range.start_secs > 0.0 {
                args.push("-ss".into());
                args.push(format_secs(range.start_secs));
            }
            if let Some(end) = range.end_secs {
                args.push("-to".into());
                args.push(format_secs(end));
            }
        }
        (None, None) => {
            if let Some(duration) = request.time_range.and_then(|r| r.duration_secs()) {
                args.push("-t".into());
                args.push(format_secs(duration));
            }
        }
    }

    if let Some(subtitles) = &request.subtitle_path {
        args.push("-vf".into());
        args.push(format!("subtitles='{}'", filter_path(subtitles)));
    }

    args.extend(
        [
            "-c:v",
            "libx264",
            "-preset",
            "veryfast",
            "-crf",
            "23",
            "-pix_fmt",
            "yuv420p",
            "-c:a",
            "aac",
            "-b:a",
            "160k",
            "-movflags",
            "+faststart",
        ]
        .map(String::from),
    );
    args.push(output.to_string_lossy().into_owned());

    args
}

/// Printable form of an invocation, for logs.
pub fn to_command_line(program: &str, args: &[String]) -> String {
    std::iter::once(program)
        .chain(args.iter().map(String::as_str))
        .map(youtube::sanitize_for_shell)
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    fn value_after<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
        args.iter()
            .position(|a| a == flag)
            .and_then(|i| args.get(i + 1))
            .map(String::as_str)
    }

    #[test]
    fn extraction_defaults() {
        let args = url_extraction_args(
            &ResolverSettings::default(),
            "https://www.youtube.com/watch?v=dQw4w9WgXcQ&list=PL1",
        );

        assert_eq!(
            args.last().map(String::as_str),
            Some("https://www.youtube.com/watch?v=dQw4w9WgXcQ")
        );
        assert!(args.contains(&"--no-playlist".to_string()));
        assert!(!args.contains(&"--cookies-from-browser".to_string()));
        assert_eq!(
            value_after(&args, "-f"),
            Some("best[ext=mp4][vcodec!=none][acodec!=none]/best")
        );

        // title must be printed before the URL
        let title = args.iter().position(|a| a == "title").unwrap();
        let urls = args.iter().position(|a| a == "urls").unwrap();
        assert!(title < urls);
    }

    #[test]
    fn extraction_with_settings() {
        let settings = ResolverSettings {
            quality: VideoQuality::P720,
            cookies_from_browser: Some(Browser::Firefox),
            playlist_mode: PlaylistMode::FirstEntry,
            time_range: None,
            custom_args: vec!["geo-bypass".into(), "socket-timeout = 15".into()],
        };
        let url = "https://www.youtube.com/watch?v=dQw4w9WgXcQ&list=PL1";
        let args = url_extraction_args(&settings, url);

        assert_eq!(value_after(&args, "--cookies-from-browser"), Some("firefox"));
        assert_eq!(value_after(&args, "--playlist-items"), Some("1"));
        assert_eq!(value_after(&args, "--socket-timeout"), Some("15"));
        assert!(args.contains(&"--geo-bypass".to_string()));
        assert!(value_after(&args, "-f").unwrap().starts_with("best[height<=720]"));
        assert_eq!(args.last().map(String::as_str), Some(url));
    }

    #[test]
    fn title_args() {
        let args = title_extraction_args(&ResolverSettings::default(), "https://youtu.be/dQw4w9WgXcQ");
        assert_eq!(value_after(&args, "--print"), Some("title"));
        assert!(args.contains(&"--skip-download".to_string()));
        assert!(!args.contains(&"-f".to_string()));
    }

    #[test]
    fn audio_only_selector() {
        assert_eq!(
            VideoQuality::AudioOnly.format_selector(),
            "bestaudio[ext=m4a]/bestaudio"
        );
    }

    #[test]
    fn custom_arg_lines() {
        let lines = [
            "",
            "# comment",
            "  proxy = socks5://127.0.0.1:1080 ",
            "-N=4",
            "no-check-certificates",
            "=orphan",
            "referer=",
        ];
        assert_eq!(
            custom_args(&lines),
            vec![
                "--proxy",
                "socks5://127.0.0.1:1080",
                "-N",
                "4",
                "--no-check-certificates",
                "--referer",
            ]
        );
    }

    #[test]
    fn conversion_plain() {
        let request = ConversionRequest::new("https://cdn.example/v.webm");
        let args = conversion_args(&request, Path::new("/tmp/out.mp4"));

        assert_eq!(value_after(&args, "-i"), Some("https://cdn.example/v.webm"));
        assert_eq!(value_after(&args, "-c:v"), Some("libx264"));
        assert_eq!(value_after(&args, "-movflags"), Some("+faststart"));
        assert!(!args.contains(&"-ss".to_string()));
        assert!(!args.contains(&"-vf".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("/tmp/out.mp4"));
    }

    #[test]
    fn conversion_trim_and_audio() {
        let mut request = ConversionRequest::new("https://cdn.example/v.webm");
        request.audio_url = Some("https://cdn.example/a.m4a".into());
        request.time_range = Some(TimeRange {
            start_secs: 10.0,
            end_secs: Some(25.5),
        });
        let args = conversion_args(&request, Path::new("out.mp4"));

        assert_eq!(args.iter().filter(|a| *a == "-ss").count(), 2);
        assert_eq!(args.iter().filter(|a| *a == "-i").count(), 2);
        assert_eq!(value_after(&args, "-ss"), Some("10.000"));
        assert_eq!(value_after(&args, "-t"), Some("15.500"));
        assert!(args.windows(2).any(|w| w[0] == "-map" && w[1] == "1:a:0"));
    }

    #[test]
    fn conversion_burns_subtitles() {
        let mut request = ConversionRequest::new("https://cdn.example/v.webm");
        request.subtitle_path = Some(PathBuf::from("C:\\subs\\it's.srt"));
        request.time_range = Some(TimeRange {
            start_secs: 5.0,
            end_secs: Some(8.0),
        });
        let args = conversion_args(&request, Path::new("out.mp4"));

        assert_eq!(
            value_after(&args, "-vf"),
            Some("subtitles='C\\:/subs/it\\'s.srt'")
        );
        // trimming moves after the input when burning subtitles
        let input = args.iter().position(|a| a == "-i").unwrap();
        let seek = args.iter().position(|a| a == "-ss").unwrap();
        assert!(seek > input);
        assert_eq!(value_after(&args, "-to"), Some("8.000"));
    }

    #[test]
    fn command_line() {
        assert_eq!(
            to_command_line("yt-dlp", &["--print".into(), "my title".into()]),
            "yt-dlp --print my\\ title"
        );
    }
}
