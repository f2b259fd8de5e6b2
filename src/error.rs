#![forbid(unsafe_code)]

//! Error kinds surfaced by the download orchestrator.
//!
//! The request handler matches on the variant to decide what to render, so
//! the split is by who is at fault: the submitted input, the external
//! downloader, or the local filesystem.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FetchError {
    /// The form was submitted without a usable URL.
    #[error("no URL provided; paste a video link and try again")]
    EmptyUrl,

    /// yt-dlp failed: unsupported URL, network failure, geo-restriction,
    /// removed video, or an unavailable format. The message carries whatever
    /// the tool wrote to stderr.
    #[error("download failed: {0}")]
    Download(String),

    /// The download reported success but no file matching the title exists
    /// in the output directory.
    #[error("downloaded file not found under {}", .0.display())]
    MissingOutput(PathBuf),

    #[error("filesystem error: {0}")]
    Io(#[from] std::io::Error),
}
