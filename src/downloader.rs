#![forbid(unsafe_code)]

//! Download orchestrator: the one place that shells out to yt-dlp.
//!
//! The orchestrator is deliberately thin. It probes the URL for a title,
//! runs the download with a fixed output template and format selection, and
//! reports the file yt-dlp wrote. Site parsing and remuxing happen inside
//! yt-dlp and are treated as opaque. Failures come back as [`FetchError`]
//! variants so the web layer can tell bad input from a failed extraction.

use crate::config::RuntimeSettings;
use crate::error::FetchError;
use anyhow::Context;
use serde::Deserialize;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::time::SystemTime;
use tempfile::NamedTempFile;

/// Format expression for the default video download. yt-dlp picks the best
/// separate streams and ffmpeg muxes them into the target container.
const VIDEO_FORMAT: &str = "bestvideo*+bestaudio/best";
const AUDIO_FORMAT: &str = "bestaudio/best";
const TARGET_CONTAINER: &str = "mp4";
/// Title used when the extractor reports none, matching yt-dlp's own habit
/// of never producing an empty filename.
const FALLBACK_TITLE: &str = "download";

/// What a successful fetch hands back to the web layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadResult {
    pub title: String,
    /// Bare file name inside the output directory, never a nested path.
    pub filepath: String,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DownloadOptions {
    /// Extract audio only and convert it to AAC instead of keeping video.
    pub audio_only: bool,
}

/// Wraps every yt-dlp invocation. Built once at startup from
/// [`RuntimeSettings`] and shared across requests; it holds no mutable state.
pub struct Downloader {
    output_dir: PathBuf,
    ytdlp_bin: PathBuf,
    // Keeps the materialized cookie jar alive for the process lifetime.
    cookie_jar: Option<NamedTempFile>,
}

impl Downloader {
    pub fn new(settings: &RuntimeSettings) -> Result<Self, FetchError> {
        let cookie_jar = match settings.cookie_text.as_deref() {
            Some(text) => Some(materialize_cookie_jar(text)?),
            None => None,
        };
        Ok(Self {
            output_dir: settings.output_dir.clone(),
            ytdlp_bin: settings.ytdlp_bin.clone(),
            cookie_jar,
        })
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Creates the output directory. Safe to call repeatedly.
    pub fn ensure_output_dir(&self) -> Result<(), FetchError> {
        fs::create_dir_all(&self.output_dir)?;
        Ok(())
    }

    /// Asks the configured binary for its version, so a missing or broken
    /// yt-dlp install surfaces at startup instead of on the first submission.
    /// The resolved version string is worth logging: download failures are
    /// often fixed by updating yt-dlp.
    pub fn tool_version(&self) -> anyhow::Result<String> {
        let output = Command::new(&self.ytdlp_bin)
            .arg("--version")
            .output()
            .with_context(|| format!("running {} --version", self.ytdlp_bin.display()))?;
        if !output.status.success() {
            anyhow::bail!(
                "{} --version exited with {}",
                self.ytdlp_bin.display(),
                output.status
            );
        }
        let version = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if version.is_empty() {
            anyhow::bail!("{} --version printed nothing", self.ytdlp_bin.display());
        }
        Ok(version)
    }

    /// Downloads the best video+audio for `url` into the output directory.
    /// Blocks until yt-dlp (and any ffmpeg remux it spawns) finishes.
    pub fn fetch(&self, url: &str) -> Result<DownloadResult, FetchError> {
        self.fetch_with(url, DownloadOptions::default())
    }

    pub fn fetch_with(
        &self,
        url: &str,
        options: DownloadOptions,
    ) -> Result<DownloadResult, FetchError> {
        let url = url.trim();
        if url.is_empty() {
            return Err(FetchError::EmptyUrl);
        }

        self.ensure_output_dir()?;
        let title = self.probe_title(url)?;
        let reported = self.run_download(url, options)?;

        // Prefer the exact path yt-dlp printed; fall back to scanning the
        // output directory for the newest file carrying the title.
        let filepath = reported
            .filter(|path| path.is_file())
            .and_then(|path| {
                path.file_name()
                    .map(|name| name.to_string_lossy().into_owned())
            })
            .map(Ok)
            .unwrap_or_else(|| self.newest_file_for_title(&title))?;

        Ok(DownloadResult { title, filepath })
    }

    /// Fetches the extractor metadata without downloading, just to resolve
    /// the title up front. Also serves as early URL validation: unsupported
    /// or unreachable URLs fail here before any media bytes move.
    fn probe_title(&self, url: &str) -> Result<String, FetchError> {
        let mut command = self.command();
        command.arg("--dump-single-json").arg("--skip-download");
        self.apply_base_flags(&mut command);
        command.arg(url);

        let output = command.output()?;
        if !output.status.success() {
            return Err(FetchError::Download(describe_failure(&output)));
        }

        let info: ProbeInfo = serde_json::from_slice(&output.stdout)
            .map_err(|err| FetchError::Download(format!("unreadable extractor metadata: {err}")))?;
        Ok(info.into_title())
    }

    /// Runs the download proper. Returns the final path yt-dlp printed via
    /// `after_move:filepath`, if any.
    fn run_download(
        &self,
        url: &str,
        options: DownloadOptions,
    ) -> Result<Option<PathBuf>, FetchError> {
        let template = self.output_dir.join("%(title)s.%(ext)s");

        let mut command = self.command();
        command
            .arg("--output")
            .arg(&template)
            .arg("--no-simulate")
            .arg("--print")
            .arg("after_move:filepath");

        if options.audio_only {
            command
                .arg("--format")
                .arg(AUDIO_FORMAT)
                .arg("--extract-audio")
                .arg("--audio-format")
                .arg("aac")
                .arg("--audio-quality")
                .arg("192K");
        } else {
            command
                .arg("--format")
                .arg(VIDEO_FORMAT)
                .arg("--merge-output-format")
                .arg(TARGET_CONTAINER);
        }

        self.apply_base_flags(&mut command);
        command.arg(url);

        let output = command.output()?;
        if !output.status.success() {
            return Err(FetchError::Download(describe_failure(&output)));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let printed = stdout
            .lines()
            .rev()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .map(PathBuf::from);
        Ok(printed)
    }

    fn command(&self) -> Command {
        Command::new(&self.ytdlp_bin)
    }

    /// Flags shared by the probe and the download, mirroring how the rest of
    /// the tool is driven: single item, bounded retries inside yt-dlp itself,
    /// cookie jar when one was configured.
    fn apply_base_flags(&self, command: &mut Command) {
        command
            .arg("--no-playlist")
            .arg("--no-warnings")
            .arg("--no-progress")
            .arg("--retries")
            .arg("3")
            .arg("--fragment-retries")
            .arg("3")
            .arg("--extractor-retries")
            .arg("3")
            .arg("--socket-timeout")
            .arg("30")
            .arg("--no-check-certificates")
            .arg("--geo-bypass");

        if let Some(jar) = &self.cookie_jar {
            command.arg("--cookies").arg(jar.path());
        }
    }

    /// Last-resort file resolution: the newest entry in the output directory
    /// whose name starts with the (path-safe) title.
    fn newest_file_for_title(&self, title: &str) -> Result<String, FetchError> {
        let stem = path_safe_stem(title);
        let prefix = format!("{stem}.");
        let mut best: Option<(SystemTime, String)> = None;

        for entry in fs::read_dir(&self.output_dir)? {
            let entry = entry?;
            if !entry.path().is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.starts_with(&prefix) {
                continue;
            }
            let modified = entry
                .metadata()?
                .modified()
                .unwrap_or(SystemTime::UNIX_EPOCH);
            match &best {
                Some((newest, _)) if *newest >= modified => {}
                _ => best = Some((modified, name)),
            }
        }

        best.map(|(_, name)| name)
            .ok_or_else(|| FetchError::MissingOutput(self.output_dir.clone()))
    }
}

/// The few fields we read out of `--dump-single-json`. Everything is optional
/// because older videos may lack metadata.
#[derive(Deserialize)]
struct ProbeInfo {
    title: Option<String>,
    fulltitle: Option<String>,
}

impl ProbeInfo {
    fn into_title(self) -> String {
        self.fulltitle
            .or(self.title)
            .filter(|title| !title.trim().is_empty())
            .unwrap_or_else(|| FALLBACK_TITLE.to_string())
    }
}

/// Extracts the most useful line from a failed yt-dlp run.
fn describe_failure(output: &Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr);
    stderr
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| format!("yt-dlp exited with {}", output.status))
}

/// Titles feed the fallback directory scan; path separators never appear in
/// names yt-dlp writes, so drop them from the pattern too.
fn path_safe_stem(title: &str) -> String {
    title.replace(['/', '\\'], "_").replace('\0', "")
}

fn materialize_cookie_jar(text: &str) -> Result<NamedTempFile, FetchError> {
    let mut jar = tempfile::Builder::new()
        .prefix("tubegrab-cookies-")
        .suffix(".txt")
        .tempfile()?;
    jar.write_all(text.as_bytes())?;
    jar.flush()?;
    Ok(jar)
}
