//! Source acquisition.
//!
//! Resolves a [`SourceDescriptor`] into a byte stream. Remote sources get
//! share-link rewriting, manual redirect following (so hops and cookies are
//! under our control) and the "confirm download" interstitial flow used by
//! some file-sharing hosts for large files.

use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use regex::Regex;
use reqwest::header::{CONTENT_DISPOSITION, CONTENT_TYPE, COOKIE, LOCATION, SET_COOKIE};
use reqwest::redirect::Policy;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::AcquireConfig;
use crate::error::FetchError;
use crate::metrics;

/// A single-use stream of source bytes.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, FetchError>> + Send>>;

/// Hosts whose share links are rewritten to the direct-download endpoint.
const DRIVE_HOSTS: &[&str] = &["drive.google.com", "docs.google.com"];

/// Direct-download endpoint for drive share links.
const DRIVE_DIRECT_BASE: &str = "https://drive.google.com/uc?export=download";

/// Where the source bytes come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceKind {
    /// Remote location fetched over HTTP(S)
    Url(String),
    /// Upload already received by the request handler
    Upload(PathBuf),
}

/// Immutable description of the request's input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceDescriptor {
    kind: SourceKind,
    filename: Option<String>,
}

impl SourceDescriptor {
    /// Describe a remote source.
    pub fn url(url: impl Into<String>, filename: Option<String>) -> Self {
        Self {
            kind: SourceKind::Url(url.into()),
            filename,
        }
    }

    /// Describe an uploaded source received into `path`.
    pub fn upload(path: impl Into<PathBuf>, filename: Option<String>) -> Self {
        Self {
            kind: SourceKind::Upload(path.into()),
            filename,
        }
    }

    pub fn kind(&self) -> &SourceKind {
        &self.kind
    }

    pub fn filename_hint(&self) -> Option<&str> {
        self.filename.as_deref()
    }

    /// Uploads can be reopened from disk; remote streams cannot be replayed.
    pub fn is_upload(&self) -> bool {
        matches!(self.kind, SourceKind::Upload(_))
    }
}

/// An opened source.
pub struct Acquired {
    pub stream: ByteStream,
    pub content_type: Option<String>,
    pub content_length: Option<u64>,
    /// Name advertised by the origin (Content-Disposition or URL path)
    pub filename: Option<String>,
}

impl std::fmt::Debug for Acquired {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Acquired")
            .field("content_type", &self.content_type)
            .field("content_length", &self.content_length)
            .field("filename", &self.filename)
            .finish_non_exhaustive()
    }
}

/// Resolves source descriptors into byte streams.
#[derive(Clone)]
pub struct Acquirer {
    client: reqwest::Client,
    config: AcquireConfig,
}

impl Acquirer {
    /// Create an acquirer. Redirects are disabled on the client because
    /// they are followed by hand.
    pub fn new(config: AcquireConfig) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .redirect(Policy::none())
            .user_agent(config.user_agent.clone())
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| FetchError::Request(e.to_string()))?;

        Ok(Self { client, config })
    }

    pub fn config(&self) -> &AcquireConfig {
        &self.config
    }

    /// Open the source as a byte stream. Does not write to disk.
    pub async fn acquire(&self, descriptor: &SourceDescriptor) -> Result<Acquired, FetchError> {
        match descriptor.kind() {
            SourceKind::Upload(path) => open_upload(path).await,
            SourceKind::Url(raw) => {
                let start = Instant::now();
                let result = self.fetch_url(raw).await;
                metrics::record_fetch(start.elapsed().as_secs_f64(), result.is_ok());
                result
            }
        }
    }

    async fn fetch_url(&self, raw: &str) -> Result<Acquired, FetchError> {
        let rewritten = rewrite_share_link(raw);
        if rewritten != raw {
            debug!(original = %raw, rewritten = %rewritten, "Rewrote share link");
        }
        let url = Url::parse(&rewritten).map_err(|e| FetchError::InvalidUrl(e.to_string()))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(FetchError::InvalidUrl(format!(
                "unsupported scheme: {}",
                url.scheme()
            )));
        }

        let mut cookies = Vec::new();
        let (final_url, response) = self.follow(url, &mut cookies).await?;

        let response = if is_html(&response) {
            self.confirm_interstitial(final_url, response, &mut cookies)
                .await?
        } else {
            response
        };

        let content_type = header_str(&response, CONTENT_TYPE);
        let filename = header_str(&response, CONTENT_DISPOSITION)
            .and_then(|cd| filename_from_disposition(&cd))
            .or_else(|| filename_from_url(response.url()));

        info!(
            url = %response.url(),
            content_type = content_type.as_deref().unwrap_or("unknown"),
            content_length = response.content_length(),
            "Source acquired"
        );

        Ok(Acquired {
            content_type,
            content_length: response.content_length(),
            filename,
            stream: with_idle_timeout(
                Box::pin(response.bytes_stream().map(|r| r.map_err(FetchError::from))),
                self.config.fetch_timeout,
            ),
        })
    }

    /// Follow redirects by hand until a 2xx response.
    ///
    /// At most `max_redirects` hops are followed. Cookies set along the way
    /// are collected and echoed on every following request.
    async fn follow(
        &self,
        start: Url,
        cookies: &mut Vec<(String, String)>,
    ) -> Result<(Url, reqwest::Response), FetchError> {
        let mut current = start;

        for hop in 0..=self.config.max_redirects {
            let mut request = self.client.get(current.clone());
            if !cookies.is_empty() {
                request = request.header(COOKIE, cookie_header(cookies));
            }

            let response = tokio::time::timeout(self.config.header_timeout, request.send())
                .await
                .map_err(|_| FetchError::Timeout(self.config.header_timeout.as_secs()))??;

            collect_cookies(&response, cookies);
            let status = response.status();

            if status.is_redirection() {
                let location = header_str(&response, LOCATION)
                    .ok_or(FetchError::Status(status.as_u16()))?;
                current = current
                    .join(&location)
                    .map_err(|e| FetchError::InvalidUrl(e.to_string()))?;
                debug!(hop = hop + 1, location = %current, "Following redirect");
                continue;
            }

            if !status.is_success() {
                warn!(url = %current, status = status.as_u16(), "Source fetch failed");
                return Err(FetchError::Status(status.as_u16()));
            }

            return Ok((current, response));
        }

        Err(FetchError::RedirectLoop(self.config.max_redirects))
    }

    /// Handle an HTML "confirm download" page: find the token, re-issue the
    /// request once with it, and insist the retry yields media.
    async fn confirm_interstitial(
        &self,
        page_url: Url,
        response: reqwest::Response,
        cookies: &mut Vec<(String, String)>,
    ) -> Result<reqwest::Response, FetchError> {
        let body = read_limited(response, self.config.max_interstitial_bytes).await?;
        let page = Interstitial::parse(&body);

        let token = page
            .token
            .clone()
            .or_else(|| cookie_token(cookies))
            .ok_or_else(|| FetchError::ContentTypeMismatch("text/html without confirm token".into()))?;

        let retry_url = page.retry_url(&page_url, &token);
        info!(url = %retry_url, "Interstitial page detected, retrying with confirm token");

        let (_, retried) = self.follow(retry_url, cookies).await?;
        if is_html(&retried) {
            return Err(FetchError::ContentTypeMismatch(
                "text/html after confirm retry".into(),
            ));
        }
        Ok(retried)
    }
}

/// End `stream` with [`FetchError::Timeout`] when no chunk arrives within `idle`.
pub fn with_idle_timeout(stream: ByteStream, idle: Duration) -> ByteStream {
    Box::pin(futures_util::stream::unfold(Some(stream), move |state| async move {
        let mut stream = state?;
        match tokio::time::timeout(idle, stream.next()).await {
            Ok(Some(item)) => Some((item, Some(stream))),
            Ok(None) => None,
            Err(_) => {
                warn!(idle_secs = idle.as_secs_f64(), "Source stalled mid-body");
                Some((Err(FetchError::Timeout(idle.as_secs())), None))
            }
        }
    }))
}

/// Write a stream into `path`, enforcing a size ceiling.
///
/// Returns the number of bytes written. A partially written file is left for
/// the caller's work directory to clean up.
pub async fn stage_stream(
    mut stream: ByteStream,
    path: &Path,
    max_bytes: u64,
) -> Result<u64, FetchError> {
    let file = tokio::fs::File::create(path).await?;
    let mut writer = BufWriter::new(file);
    let mut written: u64 = 0;

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        written += chunk.len() as u64;
        if written > max_bytes {
            return Err(FetchError::TooLarge { limit: max_bytes });
        }
        writer.write_all(&chunk).await?;
    }

    writer.flush().await?;
    debug!(path = %path.display(), bytes = written, "Staged input");
    Ok(written)
}

/// Rewrite a recognised drive share link into its direct-download form.
/// Anything else is returned unchanged.
pub fn rewrite_share_link(raw: &str) -> String {
    let Ok(url) = Url::parse(raw.trim()) else {
        return raw.to_string();
    };
    let host = url.host_str().unwrap_or_default();
    if !DRIVE_HOSTS.contains(&host) {
        return raw.to_string();
    }

    let from_path = url
        .path_segments()
        .and_then(|segments| {
            let segments: Vec<&str> = segments.collect();
            segments
                .windows(3)
                .find(|w| w[0] == "file" && w[1] == "d")
                .map(|w| w[2].to_string())
        });
    let id = from_path.or_else(|| {
        url.query_pairs()
            .find(|(k, _)| k == "id")
            .map(|(_, v)| v.into_owned())
    });

    match id {
        Some(id) if is_file_id(&id) => format!("{}&id={}", DRIVE_DIRECT_BASE, id),
        _ => raw.to_string(),
    }
}

fn is_file_id(id: &str) -> bool {
    !id.is_empty() && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

async fn open_upload(path: &Path) -> Result<Acquired, FetchError> {
    let file = tokio::fs::File::open(path).await?;
    let content_length = file.metadata().await.ok().map(|m| m.len());
    Ok(Acquired {
        stream: Box::pin(ReaderStream::new(file).map(|r| r.map_err(FetchError::Io))),
        content_type: None,
        content_length,
        filename: None,
    })
}

fn is_html(response: &reqwest::Response) -> bool {
    header_str(response, CONTENT_TYPE)
        .map(|ct| ct.to_ascii_lowercase().starts_with("text/html"))
        .unwrap_or(false)
}

fn header_str(response: &reqwest::Response, name: reqwest::header::HeaderName) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

async fn read_limited(mut response: reqwest::Response, limit: usize) -> Result<String, FetchError> {
    let mut body = Vec::new();
    while let Some(chunk) = response.chunk().await? {
        let room = limit.saturating_sub(body.len());
        body.extend_from_slice(&chunk[..chunk.len().min(room)]);
        if body.len() >= limit {
            break;
        }
    }
    Ok(String::from_utf8_lossy(&body).into_owned())
}

fn collect_cookies(response: &reqwest::Response, cookies: &mut Vec<(String, String)>) {
    for value in response.headers().get_all(SET_COOKIE) {
        let Ok(value) = value.to_str() else { continue };
        let pair = value.split(';').next().unwrap_or_default();
        if let Some((name, val)) = pair.split_once('=') {
            let name = name.trim().to_string();
            let val = val.trim().to_string();
            cookies.retain(|(n, _)| n != &name);
            cookies.push((name, val));
        }
    }
}

fn cookie_header(cookies: &[(String, String)]) -> String {
    cookies
        .iter()
        .map(|(n, v)| format!("{}={}", n, v))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Token carried by a `download_warning*` cookie.
fn cookie_token(cookies: &[(String, String)]) -> Option<String> {
    cookies
        .iter()
        .find(|(name, _)| name.starts_with("download_warning"))
        .map(|(_, value)| value.clone())
}

/// What we managed to learn from an interstitial page.
#[derive(Debug, Default, PartialEq)]
struct Interstitial {
    token: Option<String>,
    uuid: Option<String>,
    form_action: Option<String>,
    hidden: Vec<(String, String)>,
}

fn regex(slot: &'static OnceLock<Regex>, pattern: &str) -> &'static Regex {
    slot.get_or_init(|| Regex::new(pattern).expect("static regex"))
}

impl Interstitial {
    fn parse(html: &str) -> Self {
        static HIDDEN: OnceLock<Regex> = OnceLock::new();
        static NAME: OnceLock<Regex> = OnceLock::new();
        static VALUE: OnceLock<Regex> = OnceLock::new();
        static ACTION: OnceLock<Regex> = OnceLock::new();
        static HREF_CONFIRM: OnceLock<Regex> = OnceLock::new();
        static JSON_CONFIRM: OnceLock<Regex> = OnceLock::new();

        let mut page = Interstitial::default();

        for tag in regex(&HIDDEN, r#"(?i)<input[^>]*type=["']hidden["'][^>]*>"#).find_iter(html) {
            let tag = tag.as_str();
            let name = regex(&NAME, r#"name=["']([^"']+)["']"#)
                .captures(tag)
                .map(|c| c[1].to_string());
            let value = regex(&VALUE, r#"value=["']([^"']*)["']"#)
                .captures(tag)
                .map(|c| c[1].to_string());
            if let (Some(name), Some(value)) = (name, value) {
                page.hidden.push((name, value));
            }
        }

        page.form_action = regex(&ACTION, r#"(?i)<form[^>]*action=["']([^"']+)["']"#)
            .captures(html)
            .map(|c| c[1].replace("&amp;", "&"));

        let hidden_confirm = page
            .hidden
            .iter()
            .find(|(n, v)| n == "confirm" && !v.is_empty())
            .map(|(_, v)| v.clone());
        let href_confirm = regex(&HREF_CONFIRM, r"[?&;]confirm=([0-9A-Za-z_\-]+)")
            .captures(html)
            .map(|c| c[1].to_string());
        let json_confirm = regex(&JSON_CONFIRM, r#""confirm"\s*:\s*"([0-9A-Za-z_\-]+)""#)
            .captures(html)
            .map(|c| c[1].to_string());

        page.token = hidden_confirm.or(href_confirm).or(json_confirm);
        page.uuid = page
            .hidden
            .iter()
            .find(|(n, _)| n == "uuid")
            .map(|(_, v)| v.clone());
        page
    }

    /// URL for the confirmed retry: the page's form target when it has one
    /// (carrying its hidden fields), otherwise the page URL itself.
    fn retry_url(&self, page_url: &Url, token: &str) -> Url {
        let mut url = self
            .form_action
            .as_deref()
            .and_then(|action| page_url.join(action).ok())
            .unwrap_or_else(|| page_url.clone());

        let mut pairs: Vec<(String, String)> = url
            .query_pairs()
            .filter(|(k, _)| k != "confirm" && k != "uuid")
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        if self.form_action.is_some() {
            for (name, value) in &self.hidden {
                if name != "confirm" && name != "uuid" && !pairs.iter().any(|(k, _)| k == name) {
                    pairs.push((name.clone(), value.clone()));
                }
            }
        }
        pairs.push(("confirm".to_string(), token.to_string()));
        if let Some(uuid) = &self.uuid {
            pairs.push(("uuid".to_string(), uuid.clone()));
        }

        url.query_pairs_mut().clear().extend_pairs(pairs);
        url
    }
}

fn filename_from_disposition(value: &str) -> Option<String> {
    static EXTENDED: OnceLock<Regex> = OnceLock::new();
    static PLAIN: OnceLock<Regex> = OnceLock::new();

    if let Some(c) = regex(&EXTENDED, r"(?i)filename\*\s*=\s*(?:UTF-8'')?([^;]+)").captures(value) {
        let raw = c[1].trim().trim_matches('"');
        let decoded = url::form_urlencoded::parse(format!("f={}", raw).as_bytes())
            .next()
            .map(|(_, v)| v.into_owned());
        if let Some(name) = decoded.filter(|n| !n.is_empty()) {
            return Some(name);
        }
    }

    regex(&PLAIN, r#"(?i)filename\s*=\s*"?([^";]+)"?"#)
        .captures(value)
        .map(|c| c[1].trim().to_string())
        .filter(|n| !n.is_empty())
}

fn filename_from_url(url: &Url) -> Option<String> {
    url.path_segments()
        .and_then(|mut segments| segments.next_back())
        .filter(|segment| segment.contains('.'))
        .map(|segment| segment.to_string())
}
