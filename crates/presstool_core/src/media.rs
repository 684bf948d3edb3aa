use std::fs;
use std::io::Read;
use std::path::PathBuf;
use std::thread::sleep;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result, bail};
use chrono::{Datelike, Utc};
use reqwest::StatusCode;
use reqwest::blocking::Client;
use reqwest::header::CONTENT_TYPE;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::config::PressConfig;
use crate::runtime::ResolvedPaths;
use crate::store::{AttachmentRepository, META_ATTACHED_FILE, NewAttachment, PostRepository};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedMedia {
    pub bytes: Vec<u8>,
    pub content_type: Option<String>,
}

pub trait MediaFetcher {
    fn fetch(&mut self, url: &str) -> Result<FetchedMedia>;
}

#[derive(Debug, Clone)]
pub struct HttpMediaFetcherConfig {
    pub user_agent: String,
    pub timeout_ms: u64,
    pub max_bytes: u64,
    pub max_retries: usize,
    pub retry_delay_ms: u64,
}

impl HttpMediaFetcherConfig {
    pub fn from_config(config: &PressConfig) -> Self {
        Self {
            user_agent: config.user_agent(),
            timeout_ms: config.media_timeout_ms(),
            max_bytes: config.media_max_bytes(),
            max_retries: config.media_retries(),
            retry_delay_ms: config.media_retry_delay_ms(),
        }
    }
}

pub struct HttpMediaFetcher {
    client: Client,
    config: HttpMediaFetcherConfig,
}

impl HttpMediaFetcher {
    pub fn new(config: HttpMediaFetcherConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .context("failed to build media HTTP client")?;
        Ok(Self { client, config })
    }

    fn wait_before_retry(&self, attempt: usize) {
        let exponent = u32::try_from(attempt).unwrap_or(16);
        let base = self
            .config
            .retry_delay_ms
            .saturating_mul(2u64.saturating_pow(exponent));
        let jitter = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|duration| u64::from(duration.subsec_millis() % 100))
            .unwrap_or(0);
        sleep(Duration::from_millis(base.saturating_add(jitter)));
    }
}

impl MediaFetcher for HttpMediaFetcher {
    fn fetch(&mut self, url: &str) -> Result<FetchedMedia> {
        for attempt in 0..=self.config.max_retries {
            let response = self
                .client
                .get(url)
                .header("User-Agent", self.config.user_agent.clone())
                .send();

            match response {
                Ok(response) => {
                    let status = response.status();
                    if !status.is_success() {
                        if attempt < self.config.max_retries && is_retryable_status(status) {
                            self.wait_before_retry(attempt);
                            continue;
                        }
                        bail!("media download failed with HTTP {status}: {url}");
                    }
                    if let Some(length) = response.content_length()
                        && length > self.config.max_bytes
                    {
                        bail!(
                            "media is {length} bytes, over the {} byte limit: {url}",
                            self.config.max_bytes
                        );
                    }
                    let content_type = response
                        .headers()
                        .get(CONTENT_TYPE)
                        .and_then(|value| value.to_str().ok())
                        .map(|value| value.to_string());
                    let bytes = read_capped(response, self.config.max_bytes, url)?;
                    return Ok(FetchedMedia {
                        bytes,
                        content_type,
                    });
                }
                Err(error) => {
                    if attempt < self.config.max_retries && is_retryable_error(&error) {
                        self.wait_before_retry(attempt);
                        continue;
                    }
                    return Err(error).with_context(|| format!("failed to download {url}"));
                }
            }
        }

        bail!("media download exhausted retry budget: {url}")
    }
}

/// Reads at most `max_bytes`, failing once the body would go past it.
fn read_capped<R: Read>(reader: R, max_bytes: u64, url: &str) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    reader
        .take(max_bytes.saturating_add(1))
        .read_to_end(&mut bytes)
        .with_context(|| format!("failed to read media body: {url}"))?;
    if u64::try_from(bytes.len()).unwrap_or(u64::MAX) > max_bytes {
        bail!("media body exceeds the {max_bytes} byte limit: {url}");
    }
    Ok(bytes)
}

fn is_retryable_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::REQUEST_TIMEOUT
            | StatusCode::TOO_MANY_REQUESTS
            | StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT
    )
}

fn is_retryable_error(error: &reqwest::Error) -> bool {
    error.is_timeout() || error.is_connect() || error.is_request()
}

/// Where imported files land and how their public URLs are formed.
#[derive(Debug, Clone)]
pub struct MediaSettings {
    pub uploads_dir: PathBuf,
    pub public_base_url: String,
}

impl MediaSettings {
    pub fn from_config(config: &PressConfig, paths: &ResolvedPaths) -> Self {
        let site = config
            .site
            .url
            .as_deref()
            .map(|url| url.trim_end_matches('/').to_string())
            .unwrap_or_default();
        Self {
            uploads_dir: config.uploads_dir(paths),
            public_base_url: format!("{site}/wp-content/uploads"),
        }
    }

    pub fn public_url(&self, relative_file: &str) -> String {
        format!("{}/{}", self.public_base_url, relative_file.trim_start_matches('/'))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportedMedia {
    /// `None` when nothing was stored (dry run with no prior import).
    pub attachment_id: Option<i64>,
    pub url: String,
    pub reused: bool,
}

/// Media lookups available to content converters.
pub trait MediaResolver {
    fn import(&mut self, url: &str, parent_post_id: Option<i64>) -> Result<ImportedMedia>;
    fn attachment_url(&mut self, attachment_id: i64) -> Result<Option<String>>;
}

/// Idempotent media importer: source URL lookup, then content hash, then download.
pub struct MediaImporter<'a, S: ?Sized, F: ?Sized> {
    store: &'a mut S,
    fetcher: &'a mut F,
    settings: &'a MediaSettings,
    dry_run: bool,
}

impl<'a, S, F> MediaImporter<'a, S, F>
where
    S: AttachmentRepository + PostRepository + ?Sized,
    F: MediaFetcher + ?Sized,
{
    pub fn new(
        store: &'a mut S,
        fetcher: &'a mut F,
        settings: &'a MediaSettings,
        dry_run: bool,
    ) -> Self {
        Self {
            store,
            fetcher,
            settings,
            dry_run,
        }
    }

    fn reuse(&mut self, attachment_id: i64, fallback: &str) -> Result<ImportedMedia> {
        let url = self
            .attachment_url(attachment_id)?
            .unwrap_or_else(|| fallback.to_string());
        Ok(ImportedMedia {
            attachment_id: Some(attachment_id),
            url,
            reused: true,
        })
    }
}

impl<S, F> MediaResolver for MediaImporter<'_, S, F>
where
    S: AttachmentRepository + PostRepository + ?Sized,
    F: MediaFetcher + ?Sized,
{
    fn import(&mut self, url: &str, parent_post_id: Option<i64>) -> Result<ImportedMedia> {
        let url = normalize_media_url(url);
        if url.is_empty() {
            bail!("empty media URL");
        }
        if let Some(existing) = self.store.find_attachment_by_source(&url)? {
            debug!(url = %url, attachment_id = existing, "media already imported");
            return self.reuse(existing, &url);
        }
        if self.dry_run {
            return Ok(ImportedMedia {
                attachment_id: None,
                url,
                reused: false,
            });
        }

        let fetched = self.fetcher.fetch(&url)?;
        if fetched.bytes.is_empty() {
            bail!("media download returned no bytes: {url}");
        }
        let file_hash = hex_digest(&fetched.bytes);
        if let Some(existing) = self.store.find_attachment_by_hash(&file_hash)? {
            debug!(url = %url, attachment_id = existing, "identical file already imported");
            return self.reuse(existing, &url);
        }

        let filename = filename_from_url(&url, fetched.content_type.as_deref());
        let now = Utc::now();
        let relative_file = format!(
            "{:04}/{:02}/{}-{}",
            now.year(),
            now.month(),
            &file_hash[..8],
            filename
        );
        let target = self.settings.uploads_dir.join(&relative_file);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        fs::write(&target, &fetched.bytes)
            .with_context(|| format!("failed to write {}", target.display()))?;

        let mime_type = fetched
            .content_type
            .as_deref()
            .and_then(|value| value.split(';').next())
            .map(|value| value.trim().to_ascii_lowercase())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| mime_from_filename(&filename).to_string());
        let attachment_id = self.store.insert_attachment(&NewAttachment {
            title: filename,
            source_url: url.clone(),
            relative_file: relative_file.clone(),
            mime_type,
            file_hash,
            parent_post_id,
        })?;
        info!(url = %url, attachment_id, "imported media");
        Ok(ImportedMedia {
            attachment_id: Some(attachment_id),
            url: self.settings.public_url(&relative_file),
            reused: false,
        })
    }

    fn attachment_url(&mut self, attachment_id: i64) -> Result<Option<String>> {
        Ok(self
            .store
            .get_meta(attachment_id, META_ATTACHED_FILE)?
            .map(|relative| self.settings.public_url(&relative)))
    }
}

pub fn normalize_media_url(url: &str) -> String {
    let trimmed = url.trim();
    match trimmed.strip_prefix("//") {
        Some(rest) => format!("https://{rest}"),
        None => trimmed.replace("&amp;", "&"),
    }
}

pub fn hex_digest(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut output = String::with_capacity(64);
    for byte in digest.iter() {
        output.push_str(&format!("{byte:02x}"));
    }
    output
}

fn filename_from_url(url: &str, content_type: Option<&str>) -> String {
    let path = url.split(['?', '#']).next().unwrap_or_default();
    let last = path.rsplit('/').next().unwrap_or_default();
    let mut name = last
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || matches!(ch, '.' | '-' | '_') {
                ch.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect::<String>();
    name = name.trim_matches(['-', '.']).to_string();
    if name.is_empty() {
        name = "file".to_string();
    }
    if !name.contains('.')
        && let Some(extension) = content_type.and_then(extension_from_mime)
    {
        name.push('.');
        name.push_str(extension);
    }
    name
}

fn extension_from_mime(content_type: &str) -> Option<&'static str> {
    let mime = content_type.split(';').next()?.trim().to_ascii_lowercase();
    Some(match mime.as_str() {
        "image/jpeg" => "jpg",
        "image/png" => "png",
        "image/gif" => "gif",
        "image/webp" => "webp",
        "application/pdf" => "pdf",
        "audio/mpeg" => "mp3",
        "video/mp4" => "mp4",
        _ => return None,
    })
}

fn mime_from_filename(filename: &str) -> &'static str {
    let extension = filename
        .rsplit('.')
        .next()
        .unwrap_or_default()
        .to_ascii_lowercase();
    match extension.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "pdf" => "application/pdf",
        "mp3" => "audio/mpeg",
        "m4a" => "audio/mp4",
        "wav" => "audio/wav",
        "mp4" => "video/mp4",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::BTreeMap;
    use std::io::Write;
    use std::net::TcpListener;
    use std::thread::{self, JoinHandle};

    use tempfile::tempdir;

    use super::*;
    use crate::store::SqliteSite;

    /// Serves canned bodies and counts every request.
    #[derive(Default)]
    pub(crate) struct MockFetcher {
        pub bodies: BTreeMap<String, Vec<u8>>,
        pub requests: Vec<String>,
    }

    impl MockFetcher {
        pub fn with(mut self, url: &str, body: &[u8]) -> Self {
            self.bodies.insert(url.to_string(), body.to_vec());
            self
        }
    }

    impl MediaFetcher for MockFetcher {
        fn fetch(&mut self, url: &str) -> Result<FetchedMedia> {
            self.requests.push(url.to_string());
            match self.bodies.get(url) {
                Some(bytes) => Ok(FetchedMedia {
                    bytes: bytes.clone(),
                    content_type: Some("image/jpeg".to_string()),
                }),
                None => bail!("media download failed with HTTP 404 Not Found: {url}"),
            }
        }
    }

    fn settings(root: &std::path::Path) -> MediaSettings {
        MediaSettings {
            uploads_dir: root.join("uploads"),
            public_base_url: "https://news.example.org/wp-content/uploads".to_string(),
        }
    }

    #[test]
    fn import_downloads_once_and_reuses_by_source() {
        let temp = tempdir().expect("tempdir");
        let settings = settings(temp.path());
        let mut site = SqliteSite::open_in_memory().expect("site");
        let mut fetcher = MockFetcher::default().with("https://legacy.example/a.jpg", b"jpeg-a");

        let first = MediaImporter::new(&mut site, &mut fetcher, &settings, false)
            .import("https://legacy.example/a.jpg", None)
            .expect("first import");
        assert!(!first.reused);
        let id = first.attachment_id.expect("attachment id");
        assert!(first.url.starts_with("https://news.example.org/wp-content/uploads/"));
        assert!(first.url.ends_with("-a.jpg"));

        let second = MediaImporter::new(&mut site, &mut fetcher, &settings, false)
            .import("https://legacy.example/a.jpg", None)
            .expect("second import");
        assert!(second.reused);
        assert_eq!(second.attachment_id, Some(id));
        assert_eq!(second.url, first.url);
        assert_eq!(fetcher.requests.len(), 1);

        let relative = site
            .get_meta(id, META_ATTACHED_FILE)
            .expect("meta")
            .expect("attached file");
        assert_eq!(
            fs::read(settings.uploads_dir.join(relative)).expect("stored file"),
            b"jpeg-a"
        );
    }

    #[test]
    fn identical_bytes_under_new_url_reuse_attachment() {
        let temp = tempdir().expect("tempdir");
        let settings = settings(temp.path());
        let mut site = SqliteSite::open_in_memory().expect("site");
        let mut fetcher = MockFetcher::default()
            .with("https://legacy.example/a.jpg", b"same")
            .with("https://cdn.legacy.example/a-copy.jpg", b"same");

        let mut importer = MediaImporter::new(&mut site, &mut fetcher, &settings, false);
        let first = importer
            .import("https://legacy.example/a.jpg", Some(5))
            .expect("first");
        let second = importer
            .import("//cdn.legacy.example/a-copy.jpg", None)
            .expect("second");
        assert_eq!(first.attachment_id, second.attachment_id);
        assert!(second.reused);
        assert_eq!(site.stats().expect("stats").attachments, 1);
    }

    #[test]
    fn dry_run_never_downloads() {
        let temp = tempdir().expect("tempdir");
        let settings = settings(temp.path());
        let mut site = SqliteSite::open_in_memory().expect("site");
        let mut fetcher = MockFetcher::default().with("https://legacy.example/a.jpg", b"jpeg");

        let imported = MediaImporter::new(&mut site, &mut fetcher, &settings, true)
            .import("https://legacy.example/a.jpg", None)
            .expect("dry run");
        assert_eq!(imported.attachment_id, None);
        assert_eq!(imported.url, "https://legacy.example/a.jpg");
        assert!(fetcher.requests.is_empty());
        assert_eq!(site.stats().expect("stats").attachments, 0);
    }

    #[test]
    fn failed_download_is_an_error() {
        let temp = tempdir().expect("tempdir");
        let settings = settings(temp.path());
        let mut site = SqliteSite::open_in_memory().expect("site");
        let mut fetcher = MockFetcher::default();
        let error = MediaImporter::new(&mut site, &mut fetcher, &settings, false)
            .import("https://legacy.example/missing.jpg", None)
            .expect_err("must fail");
        assert!(error.to_string().contains("404"));
    }

    fn http_fetcher(max_bytes: u64, max_retries: usize) -> HttpMediaFetcher {
        HttpMediaFetcher::new(HttpMediaFetcherConfig {
            user_agent: "presstool-test".to_string(),
            timeout_ms: 5_000,
            max_bytes,
            max_retries,
            retry_delay_ms: 0,
        })
        .expect("client")
    }

    /// Answers one connection per canned response, then reports how many were served.
    fn serve(responses: Vec<String>) -> (String, JoinHandle<usize>) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let address = listener.local_addr().expect("address");
        let handle = thread::spawn(move || {
            let mut served = 0;
            for response in responses {
                let (mut stream, _) = listener.accept().expect("accept");
                let mut request = [0u8; 4096];
                let _ = stream.read(&mut request);
                let _ = stream.write_all(response.as_bytes());
                served += 1;
            }
            served
        });
        (format!("http://{address}/photo.jpg"), handle)
    }

    fn response(status: &str, body: &str) -> String {
        format!(
            "HTTP/1.1 {status}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        )
    }

    #[test]
    fn http_fetch_retries_unavailable_then_succeeds() {
        let (url, server) = serve(vec![
            response("503 Service Unavailable", ""),
            response("200 OK", "jpeg"),
        ]);
        let fetched = http_fetcher(1024, 2).fetch(&url).expect("fetch");
        assert_eq!(fetched.bytes, b"jpeg");
        assert_eq!(fetched.content_type.as_deref(), Some("image/jpeg"));
        assert_eq!(server.join().expect("server"), 2);
    }

    #[test]
    fn http_fetch_gives_up_on_not_found() {
        let (url, server) = serve(vec![response("404 Not Found", "")]);
        let error = http_fetcher(1024, 3).fetch(&url).expect_err("must fail");
        assert!(error.to_string().contains("404"));
        assert_eq!(server.join().expect("server"), 1);
    }

    #[test]
    fn http_fetch_rejects_declared_and_chunked_oversize_bodies() {
        let (url, server) = serve(vec![response("200 OK", "0123456789abcdef")]);
        let error = http_fetcher(8, 0).fetch(&url).expect_err("declared length");
        assert!(error.to_string().contains("byte limit"));
        server.join().expect("server");

        let chunked = "HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\nConnection: close\r\n\r\n\
                       10\r\n0123456789abcdef\r\n0\r\n\r\n"
            .to_string();
        let (url, server) = serve(vec![chunked]);
        let error = http_fetcher(8, 0).fetch(&url).expect_err("chunked body");
        assert!(error.to_string().contains("byte limit"));
        server.join().expect("server");
    }

    #[test]
    fn capped_reads_stop_one_byte_past_the_limit() {
        let body = vec![7u8; 64];
        assert_eq!(read_capped(&body[..], 64, "u").expect("at limit").len(), 64);
        let error = read_capped(&body[..], 63, "u").expect_err("over limit");
        assert!(error.to_string().contains("63 byte limit"));
    }

    #[test]
    fn filenames_are_sanitized() {
        assert_eq!(
            filename_from_url("https://x.example/Photos/My%20Pic.JPG?w=300", None),
            "my-20pic.jpg"
        );
        assert_eq!(filename_from_url("https://x.example/", Some("image/png")), "file.png");
        assert_eq!(mime_from_filename("doc.PDF"), "application/pdf");
        assert_eq!(hex_digest(b"abc").len(), 64);
    }
}
