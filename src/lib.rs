//! # ytplay-rs
//!
//! This crate turns YouTube page URLs into direct, playable stream URLs by
//! driving [yt-dlp](https://github.com/yt-dlp/yt-dlp), and optionally converts
//! those streams into local MP4 files with ffmpeg. It is meant to sit behind a
//! media player that cannot talk to YouTube itself.
//!
//! ## Usage
//!
//! The [`tools`] module makes sure yt-dlp is present, the [`resolver`] module
//! runs it and caches the answers on disk until the stream URLs expire.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use tokio_util::sync::CancellationToken;
//! use ytplay_rs::{
//!     command::ResolverSettings,
//!     process::ProcessRunner,
//!     resolver::Resolver,
//!     tools::{ToolKind, ToolManager},
//!     util,
//! };
//!
//! #[tokio::main]
//! async fn main() {
//!     let cancel = CancellationToken::new();
//!
//!     // Find yt-dlp, downloading it into ./tools if it is not installed
//!     let client = util::HttpClient::new().unwrap();
//!     let tools = ToolManager::new("tools", Arc::new(client), ProcessRunner::new());
//!     let ytdlp = tools.ensure(ToolKind::YtDlp, &cancel).await.unwrap();
//!
//!     // Resolve, reusing earlier answers that have not expired yet
//!     let resolver = Resolver::new(ProcessRunner::new(), ytdlp, ResolverSettings::default())
//!         .with_cache_file("url-cache.json");
//!     resolver.load_cache().await.unwrap();
//!
//!     let resolved = resolver
//!         .resolve("https://www.youtube.com/watch?v=...", &cancel)
//!         .await
//!         .unwrap();
//!     println!("{}: {}", resolved.title, resolved.direct_url);
//!
//!     // Keep the cache for next time
//!     resolver.persist().await.unwrap();
//! }
//! ```
//!
//! Every external process goes through [`process::ProcessRunner`], which
//! enforces a timeout and honours a [`tokio_util::sync::CancellationToken`];
//! the two failure modes are reported separately.

#![forbid(unsafe_code)]
#[macro_use]
extern crate log;

pub mod cache;
pub mod command;
pub mod config;
pub mod ffmpeg;
pub mod process;
pub mod resolver;
pub mod tools;
pub mod util;
pub mod youtube;
