#![forbid(unsafe_code)]

//! Minimal Axum front-end over the yt-dlp orchestrator.
//!
//! Three routes: `GET /` renders the submission form, `POST /` runs a
//! download synchronously and renders the outcome, and
//! `GET /download/{filename}` streams a finished file back as an attachment.
//! Each request is independent; the only shared state is the output
//! directory on disk.

use std::{
    ffi::OsStr,
    net::{IpAddr, SocketAddr},
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result, anyhow};
use axum::{
    Router,
    body::Body,
    extract::{Form, Path as AxumPath, State},
    http::{StatusCode, header},
    response::{Html, IntoResponse, Response},
    routing::get,
};
use mime_guess::MimeGuess;
use percent_encoding::{AsciiSet, CONTROLS, NON_ALPHANUMERIC, utf8_percent_encode};
use serde::Deserialize;
use tokio::{fs::File, signal};
use tokio_util::io::ReaderStream;
use tubegrab::config::{RuntimeOverrides, RuntimeSettings, resolve_runtime_settings};
use tubegrab::downloader::{DownloadOptions, DownloadResult, Downloader};
use tubegrab::error::FetchError;

/// Characters escaped when a file name becomes a URL path segment.
const HREF_SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'/')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}');

fn parse_args() -> Result<RuntimeSettings> {
    args_from_iter(std::env::args().skip(1))
}

fn args_from_iter<I>(iter: I) -> Result<RuntimeSettings>
where
    I: IntoIterator<Item = String>,
{
    let mut output_dir_override: Option<PathBuf> = None;
    let mut port_override: Option<u16> = None;
    let mut host_override: Option<String> = None;
    let mut args = iter.into_iter();

    while let Some(arg) = args.next() {
        if let Some(value) = arg.strip_prefix("--output-dir=") {
            output_dir_override = Some(PathBuf::from(value));
            continue;
        }
        if let Some(value) = arg.strip_prefix("--port=") {
            port_override = Some(parse_port_arg(value)?);
            continue;
        }
        if let Some(value) = arg.strip_prefix("--host=") {
            host_override = Some(value.to_string());
            continue;
        }

        match arg.as_str() {
            "--output-dir" => {
                let value = args
                    .next()
                    .ok_or_else(|| anyhow!("--output-dir requires a value"))?;
                output_dir_override = Some(PathBuf::from(value));
            }
            "--port" => {
                let value = args
                    .next()
                    .ok_or_else(|| anyhow!("--port requires a value"))?;
                port_override = Some(parse_port_arg(&value)?);
            }
            "--host" => {
                let value = args
                    .next()
                    .ok_or_else(|| anyhow!("--host requires a value"))?;
                host_override = Some(value);
            }
            _ => return Err(anyhow!("unknown argument: {arg}")),
        }
    }

    resolve_runtime_settings(RuntimeOverrides {
        output_dir: output_dir_override,
        port: port_override,
        host: host_override,
        ..RuntimeOverrides::default()
    })
}

fn parse_port_arg(value: &str) -> Result<u16> {
    value
        .parse::<u16>()
        .context("expected a numeric port between 0 and 65535")
}

fn parse_host_arg(value: &str) -> Result<IpAddr> {
    value
        .parse::<IpAddr>()
        .context("expected a valid IPv4 or IPv6 address for --host/TUBEGRAB_HOST")
}

/// Shared state injected into every handler.
#[derive(Clone)]
struct AppState {
    downloader: Arc<Downloader>,
}

/// Error shape for the file-serving route. Form routes never fail outward;
/// they re-render the page with an inline message instead.
#[derive(Debug)]
struct HttpError {
    status: StatusCode,
    message: String,
}

impl HttpError {
    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        let body = format!(
            "<!doctype html>\n<html><body><h1>{}</h1><p>{}</p></body></html>\n",
            self.status, self.message
        );
        (self.status, Html(body)).into_response()
    }
}

type HttpResult<T> = std::result::Result<T, HttpError>;

#[tokio::main]
async fn main() -> Result<()> {
    let settings = parse_args()?;

    let host = parse_host_arg(&settings.host)?;
    let port = settings.port;

    let downloader = Downloader::new(&settings).context("initializing downloader")?;
    let tool_version = downloader
        .tool_version()
        .context("yt-dlp must be installed and runnable")?;
    downloader
        .ensure_output_dir()
        .context("creating the output directory")?;
    println!("Using yt-dlp {}", tool_version);
    println!("Output directory: {}", downloader.output_dir().display());

    let state = AppState {
        downloader: Arc::new(downloader),
    };

    let app = Router::new()
        .route("/", get(index).post(submit))
        .route("/download/{filename}", get(serve_download))
        .with_state(state);

    let addr = SocketAddr::new(host, port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {}", addr))?;
    println!("tubegrab listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running server")?;

    Ok(())
}

async fn shutdown_signal() {
    // Failure here only affects graceful shutdown; the process still
    // terminates when Ctrl+C fires.
    if let Err(err) = signal::ctrl_c().await {
        eprintln!("Failed to install Ctrl+C handler: {}", err);
    }
}

#[derive(Deserialize)]
struct DownloadForm {
    url: Option<String>,
    audio: Option<String>,
}

async fn index() -> Html<String> {
    render_page(None, None)
}

/// Handles the form submission. The request blocks until yt-dlp and any
/// remux finish; every failure ends up as an inline message on the page,
/// never a 500.
async fn submit(State(state): State<AppState>, Form(form): Form<DownloadForm>) -> Html<String> {
    let url = form.url.as_deref().map(str::trim).unwrap_or_default();
    if url.is_empty() {
        return render_page(None, Some(&FetchError::EmptyUrl.to_string()));
    }

    let options = DownloadOptions {
        audio_only: form.audio.is_some(),
    };
    let downloader = state.downloader.clone();
    let url = url.to_string();
    println!("Download requested: {}", url);

    let outcome =
        tokio::task::spawn_blocking(move || downloader.fetch_with(&url, options)).await;

    match outcome {
        Ok(Ok(result)) => {
            println!("Downloaded: {}", result.filepath);
            render_page(Some(&result), None)
        }
        Ok(Err(err)) => {
            eprintln!("Download failed: {}", err);
            render_page(None, Some(&page_message(&err)))
        }
        Err(err) => {
            eprintln!("Download task panicked: {}", err);
            render_page(None, Some("the download task failed unexpectedly"))
        }
    }
}

/// Maps each error kind to the message shown on the page.
fn page_message(err: &FetchError) -> String {
    match err {
        FetchError::EmptyUrl => err.to_string(),
        FetchError::Download(detail) => {
            format!("the video could not be downloaded: {detail}")
        }
        FetchError::MissingOutput(_) | FetchError::Io(_) => {
            format!("a storage problem occurred on the server: {err}")
        }
    }
}

/// Sends a finished file out of the output directory as an attachment.
/// Whole-file responses only; there is no byte-range handling.
async fn serve_download(
    State(state): State<AppState>,
    AxumPath(filename): AxumPath<String>,
) -> HttpResult<Response> {
    let target = resolve_download_path(state.downloader.output_dir(), &filename)?;

    let file = File::open(&target)
        .await
        .map_err(|_| HttpError::not_found("file not found"))?;
    let size = file
        .metadata()
        .await
        .map_err(|_| HttpError::not_found("file not found"))?
        .len();
    let content_type = MimeGuess::from_path(&target)
        .first_raw()
        .unwrap_or("application/octet-stream");

    Response::builder()
        .header(header::CONTENT_TYPE, content_type)
        .header(header::CONTENT_LENGTH, size)
        .header(header::CONTENT_DISPOSITION, content_disposition(&filename))
        .body(Body::from_stream(ReaderStream::new(file)))
        .map_err(|err| HttpError::internal(err.to_string()))
}

/// Maps the requested name onto a file inside the output directory.
///
/// The route matches a single path segment, but the captured value arrives
/// percent-decoded, so separators and dot names can sneak back in. Only a
/// plain, visible file name is accepted; everything else reads as a missing
/// file, without hinting at why it was refused.
fn resolve_download_path(base: &Path, name: &str) -> HttpResult<PathBuf> {
    let plain_name =
        !name.is_empty() && !name.starts_with('.') && !name.contains(['/', '\\', '\0']);
    if !plain_name {
        return Err(HttpError::not_found("file not found"));
    }

    let target = base.join(name);
    // A name that passed the checks above joins to a direct child of the
    // output directory; anything else means the checks missed a case.
    if target.parent() != Some(base) || target.file_name() != Some(OsStr::new(name)) {
        return Err(HttpError::not_found("file not found"));
    }
    Ok(target)
}

/// Builds `Content-Disposition: attachment` carrying both an ASCII fallback
/// name and the RFC 5987 encoded original, since titles are rarely ASCII.
fn content_disposition(filename: &str) -> header::HeaderValue {
    let ascii: String = filename
        .chars()
        .map(|c| {
            if (c.is_ascii_graphic() && c != '"' && c != '\\') || c == ' ' {
                c
            } else {
                '_'
            }
        })
        .collect();
    let encoded = utf8_percent_encode(filename, NON_ALPHANUMERIC).to_string();
    format!("attachment; filename=\"{ascii}\"; filename*=UTF-8''{encoded}")
        .parse()
        .unwrap_or_else(|_| header::HeaderValue::from_static("attachment"))
}

fn render_page(result: Option<&DownloadResult>, error: Option<&str>) -> Html<String> {
    let mut inner = String::new();

    if let Some(message) = error {
        inner.push_str(&format!(
            "    <p class=\"error\">{}</p>\n",
            html_escape(message)
        ));
    }

    if let Some(result) = result {
        let href = utf8_percent_encode(&result.filepath, HREF_SEGMENT);
        inner.push_str(&format!(
            "    <p class=\"result\">Downloaded <strong>{}</strong></p>\n    <p><a href=\"/download/{}\" download>Save file</a></p>\n",
            html_escape(&result.title),
            href
        ));
    }

    Html(format!(
        r#"<!doctype html>
<html>
<head>
  <meta charset="utf-8">
  <title>tubegrab</title>
  <style>
    body {{ font-family: sans-serif; max-width: 40rem; margin: 3rem auto; }}
    input[type=url] {{ width: 100%; padding: 0.4rem; }}
    .error {{ color: #a00; }}
    .result {{ color: #060; }}
  </style>
</head>
<body>
  <h1>tubegrab</h1>
  <form method="post" action="/">
    <p><input type="url" name="url" placeholder="Paste a video URL"></p>
    <p><label><input type="checkbox" name="audio"> Audio only (AAC)</label></p>
    <p><button type="submit">Download</button></p>
  </form>
{inner}</body>
</html>
"#
    ))
}

fn html_escape(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use axum::body::to_bytes;
    use axum::extract::State as AxumState;
    use std::sync::Mutex;
    use std::{env, fs};
    #[cfg(unix)]
    use std::os::unix::fs::PermissionsExt;
    use tempfile::{TempDir, tempdir};

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn with_env_file(vars: &[(&str, &str)], f: impl FnOnce()) {
        let _lock = ENV_LOCK.lock().unwrap();
        let dir = tempdir().unwrap();
        let mut contents = String::new();
        for (key, value) in vars {
            contents.push_str(&format!("{key}=\"{value}\"\n"));
        }
        fs::write(dir.path().join(".env"), contents).unwrap();
        let cwd = env::current_dir().unwrap();
        env::set_current_dir(dir.path()).unwrap();
        f();
        env::set_current_dir(cwd).unwrap();
    }

    fn parse_with_env(env_values: &[(&str, &str)], extra: &[&str]) -> RuntimeSettings {
        let argv = extra
            .iter()
            .map(|value| value.to_string())
            .collect::<Vec<_>>();
        let mut parsed = None;
        with_env_file(env_values, || {
            parsed = Some(args_from_iter(argv.clone()).expect("parsed args"));
        });
        parsed.expect("args set")
    }

    /// Stub yt-dlp used by the handler tests. Answers the metadata probe
    /// with a title derived from the URL's last path segment, then "downloads"
    /// by writing `<title>.mp4` next to the output template and printing the
    /// final path. Every invocation appends its argv to `args.log`.
    const STUB_OK: &str = r#"#!/usr/bin/env bash
set -eu
args=("$@")
output=""
prev=""
for arg in "$@"; do
  if [[ "$prev" == "--output" ]]; then
    output="$arg"
  fi
  prev="$arg"
done
url="${args[${#args[@]}-1]}"
title="${url##*/}"
if [[ -z "$title" ]]; then
  title="download"
fi
printf '%s\n' "${args[@]}" >> "$(dirname "$0")/args.log"
if printf '%s\n' "${args[@]}" | grep -q -- '--dump-single-json'; then
  printf '{"title": "%s"}\n' "$title"
  exit 0
fi
dir="$(dirname "$output")"
mkdir -p "$dir"
target="$dir/$title.mp4"
echo "media bytes" > "$target"
echo "$target"
exit 0
"#;

    const STUB_FAILING: &str = r#"#!/usr/bin/env bash
echo "ERROR: Unsupported URL: junk" >&2
exit 1
"#;

    struct ServerTestContext {
        temp: TempDir,
        state: AppState,
    }

    impl ServerTestContext {
        fn new(stub_script: &str) -> Self {
            let temp = tempdir().unwrap();
            let stub = temp.path().join("yt-dlp");
            fs::write(&stub, stub_script).unwrap();
            #[cfg(unix)]
            {
                let mut perms = fs::metadata(&stub).unwrap().permissions();
                perms.set_mode(0o755);
                fs::set_permissions(&stub, perms).unwrap();
            }

            let settings = RuntimeSettings {
                output_dir: temp.path().join("downloads"),
                port: 0,
                host: "127.0.0.1".into(),
                ytdlp_bin: stub,
                cookie_text: None,
            };
            let downloader = Downloader::new(&settings).unwrap();
            downloader.ensure_output_dir().unwrap();

            Self {
                state: AppState {
                    downloader: Arc::new(downloader),
                },
                temp,
            }
        }

        fn output_dir(&self) -> PathBuf {
            self.state.downloader.output_dir().to_path_buf()
        }

        async fn submit(&self, url: Option<&str>, audio: bool) -> String {
            let form = DownloadForm {
                url: url.map(str::to_string),
                audio: if audio { Some("on".into()) } else { None },
            };
            let Html(page) = super::submit(AxumState(self.state.clone()), Form(form)).await;
            page
        }
    }

    #[test]
    fn args_default_port_host_and_output_dir() {
        let settings = parse_with_env(&[], &[]);
        assert_eq!(settings.port, 5000);
        assert_eq!(settings.host, "0.0.0.0");
        assert_eq!(settings.output_dir, PathBuf::from("downloads"));
    }

    #[test]
    fn args_read_env_file() {
        let settings = parse_with_env(
            &[
                ("OUTPUT_DIR", "/srv/clips"),
                ("TUBEGRAB_PORT", "4242"),
                ("TUBEGRAB_HOST", "127.0.0.1"),
            ],
            &[],
        );
        assert_eq!(settings.output_dir, PathBuf::from("/srv/clips"));
        assert_eq!(settings.port, 4242);
        assert_eq!(settings.host, "127.0.0.1");
    }

    #[test]
    fn cli_flags_override_env_file() {
        let settings = parse_with_env(
            &[("OUTPUT_DIR", "/srv/clips"), ("TUBEGRAB_PORT", "4242")],
            &["--output-dir", "/custom", "--port=9000", "--host", "::1"],
        );
        assert_eq!(settings.output_dir, PathBuf::from("/custom"));
        assert_eq!(settings.port, 9000);
        assert_eq!(settings.host, "::1");
    }

    #[test]
    fn unknown_argument_is_rejected() {
        let err = args_from_iter(vec!["--bogus".to_string()]).unwrap_err();
        assert!(err.to_string().contains("unknown argument"));
    }

    #[test]
    fn host_strings_parse_to_addresses() {
        assert!(parse_host_arg("0.0.0.0").is_ok());
        assert!(parse_host_arg("::1").is_ok());
        assert!(parse_host_arg("not-a-host").is_err());
    }

    #[tokio::test]
    async fn index_renders_the_form() {
        let Html(page) = super::index().await;
        assert!(page.contains("<form method=\"post\""));
        assert!(page.contains("name=\"url\""));
        assert!(!page.contains("class=\"error\""));
    }

    #[tokio::test]
    async fn missing_url_re_renders_form_with_input_error() {
        let ctx = ServerTestContext::new(STUB_OK);
        let page = ctx.submit(None, false).await;
        assert!(page.contains("class=\"error\""));
        assert!(page.contains("no URL provided"));
        assert!(page.contains("<form method=\"post\""));
    }

    #[tokio::test]
    async fn blank_url_re_renders_form_with_input_error() {
        let ctx = ServerTestContext::new(STUB_OK);
        let page = ctx.submit(Some("   "), false).await;
        assert!(page.contains("no URL provided"));
    }

    #[tokio::test]
    async fn successful_submit_links_to_the_download_route() {
        let ctx = ServerTestContext::new(STUB_OK);
        let page = ctx.submit(Some("https://example.test/watch/clip-one"), false).await;
        assert!(page.contains("Downloaded <strong>clip-one</strong>"), "got: {page}");
        assert!(page.contains("href=\"/download/clip-one.mp4\""));
        assert!(ctx.output_dir().join("clip-one.mp4").is_file());
    }

    #[tokio::test]
    async fn submit_then_serve_roundtrip_returns_the_media() {
        let ctx = ServerTestContext::new(STUB_OK);
        ctx.submit(Some("https://example.test/watch/clip-two"), false)
            .await;

        let response = super::serve_download(
            AxumState(ctx.state.clone()),
            AxumPath("clip-two.mp4".to_string()),
        )
        .await
        .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let disposition = response
            .headers()
            .get(header::CONTENT_DISPOSITION)
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();
        assert!(disposition.starts_with("attachment"));
        let length: u64 = response
            .headers()
            .get(header::CONTENT_LENGTH)
            .unwrap()
            .to_str()
            .unwrap()
            .parse()
            .unwrap();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert!(!body.is_empty());
        assert_eq!(length, body.len() as u64);
    }

    #[tokio::test]
    async fn two_submissions_leave_two_files_behind() {
        let ctx = ServerTestContext::new(STUB_OK);
        ctx.submit(Some("https://example.test/watch/alpha"), false)
            .await;
        ctx.submit(Some("https://example.test/watch/beta"), false)
            .await;
        assert!(ctx.output_dir().join("alpha.mp4").is_file());
        assert!(ctx.output_dir().join("beta.mp4").is_file());
    }

    #[tokio::test]
    async fn rejected_url_renders_error_not_a_fault() {
        let ctx = ServerTestContext::new(STUB_FAILING);
        let page = ctx.submit(Some("junk"), false).await;
        assert!(page.contains("class=\"error\""));
        assert!(page.contains("Unsupported URL"), "got: {page}");
        assert!(page.contains("<form method=\"post\""));
    }

    #[tokio::test]
    async fn audio_checkbox_switches_ytdlp_to_extraction() -> Result<()> {
        let ctx = ServerTestContext::new(STUB_OK);
        ctx.submit(Some("https://example.test/watch/tune"), true)
            .await;

        let log = fs::read_to_string(ctx.temp.path().join("args.log"))?;
        assert!(log.contains("--extract-audio"));
        assert!(log.contains("bestaudio/best"));
        Ok(())
    }

    #[tokio::test]
    async fn serving_a_missing_file_is_404() {
        let ctx = ServerTestContext::new(STUB_OK);
        let err = super::serve_download(
            AxumState(ctx.state.clone()),
            AxumPath("ghost.mp4".to_string()),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn path_traversal_is_rejected() {
        let ctx = ServerTestContext::new(STUB_OK);
        fs::write(ctx.temp.path().join("secret.txt"), "hidden").unwrap();

        for attempt in ["../secret.txt", "..", ".", ".hidden", "a/../b", "/etc/passwd", ""] {
            let err = super::serve_download(
                AxumState(ctx.state.clone()),
                AxumPath(attempt.to_string()),
            )
            .await
            .unwrap_err();
            assert_eq!(err.status, StatusCode::NOT_FOUND, "attempt: {attempt}");
        }
    }

    #[test]
    fn download_paths_resolve_only_plain_names() {
        let base = Path::new("/srv/out");
        assert_eq!(
            resolve_download_path(base, "clip.mp4").unwrap(),
            Path::new("/srv/out/clip.mp4")
        );
        assert!(resolve_download_path(base, "spaced name.mp4").is_ok());
        for bad in ["", ".", "..", ".env", "../clip.mp4", "a/b.mp4", "a\\b.mp4", "nul\0.mp4"] {
            assert!(resolve_download_path(base, bad).is_err(), "accepted {bad:?}");
        }
    }

    #[test]
    fn titles_are_escaped_in_the_page() {
        let result = DownloadResult {
            title: "<script>alert(1)</script>".into(),
            filepath: "x.mp4".into(),
        };
        let Html(page) = render_page(Some(&result), None);
        assert!(!page.contains("<script>alert"));
        assert!(page.contains("&lt;script&gt;"));
    }

    #[test]
    fn hrefs_are_percent_encoded() {
        let result = DownloadResult {
            title: "spaced out".into(),
            filepath: "spaced out.mp4".into(),
        };
        let Html(page) = render_page(Some(&result), None);
        assert!(page.contains("href=\"/download/spaced%20out.mp4\""));
    }

    #[test]
    fn content_disposition_stays_ascii_for_unicode_names() {
        let value = content_disposition("日本語タイトル.mp4");
        let text = value.to_str().expect("header must be visible ASCII");
        assert!(text.starts_with("attachment"));
        assert!(text.contains("filename*=UTF-8''"));
    }

    #[test]
    fn error_kinds_map_to_distinct_messages() {
        assert!(page_message(&FetchError::EmptyUrl).contains("no URL"));
        assert!(page_message(&FetchError::Download("403".into())).contains("could not be downloaded"));
        let io_err = FetchError::Io(std::io::Error::other("disk"));
        assert!(page_message(&io_err).contains("storage problem"));
    }
}
