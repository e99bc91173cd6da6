use std::sync::OnceLock;

use chrono::{DateTime, Duration, TimeZone, Utc};
use regex::Regex;
use url::Url;

/// Query parameters that turn a watch URL into a playlist URL.
const PLAYLIST_PARAMS: &[&str] = &["list", "index", "start_radio", "pp"];

/// Characters [`sanitize_for_shell`] escapes. Backslash is deliberately absent.
const SHELL_METACHARACTERS: &[char] = &[
    '"', '\'', '`', '$', '&', '|', ';', '<', '>', '(', ')', '*', '?', ' ',
];

fn video_id_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?:^|//|\.)(?:youtube(?:-nocookie)?\.com/(?:watch\?(?:[^#]*&)?v=|embed/|shorts/|live/|v/|e/)|youtu\.be/)([A-Za-z0-9_-]{11})(?:[^A-Za-z0-9_-]|$)",
        )
        .expect("video id regex is valid")
    })
}

/// Returns the 11-character YouTube video id contained in `url`, if any.
pub fn extract_video_id(url: &str) -> Option<String> {
    video_id_regex()
        .captures(url.trim())
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

/// Key used by the URL cache: the video id when there is one, otherwise the
/// trimmed URL itself.
pub fn cache_key(url: &str) -> String {
    extract_video_id(url).unwrap_or_else(|| url.trim().to_string())
}

pub fn watch_url(video_id: &str) -> String {
    format!("https://www.youtube.com/watch?v={}", video_id)
}

/// Drops playlist-related query parameters. Unparseable input is returned
/// unchanged.
pub fn strip_playlist(url: &str) -> String {
    let Ok(mut parsed) = Url::parse(url.trim()) else {
        return url.to_string();
    };

    let kept: Vec<(String, String)> = parsed
        .query_pairs()
        .filter(|(k, _)| !PLAYLIST_PARAMS.iter().any(|p| k == p))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();

    if kept.is_empty() {
        parsed.set_query(None);
    } else {
        let mut pairs = parsed.query_pairs_mut();
        pairs.clear();
        for (k, v) in &kept {
            pairs.append_pair(k, v);
        }
    }

    parsed.to_string()
}

/// Reads the expiry timestamp googlevideo embeds in stream URLs, either as an
/// `expire=` query parameter or as an `/expire/<secs>/` path segment.
pub fn parse_expiry(url: &str) -> Option<DateTime<Utc>> {
    let parsed = Url::parse(url.trim()).ok()?;

    let secs = parsed
        .query_pairs()
        .find(|(k, _)| k == "expire")
        .map(|(_, v)| v.into_owned())
        .or_else(|| {
            let mut segments = parsed.path_segments()?;
            segments.by_ref().find(|s| *s == "expire")?;
            segments.next().map(str::to_string)
        })?;

    let secs: i64 = secs.trim().parse().ok()?;
    Utc.timestamp_opt(secs, 0).single()
}

pub fn expiry_or_default(url: &str, now: DateTime<Utc>, default_ttl: Duration) -> DateTime<Utc> {
    parse_expiry(url).unwrap_or(now + default_ttl)
}

/// Backslash-escapes shell metacharacters. Applying it twice is not a no-op.
pub fn sanitize_for_shell(arg: &str) -> String {
    let mut out = String::with_capacity(arg.len());
    for c in arg.chars() {
        if SHELL_METACHARACTERS.contains(&c) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}
