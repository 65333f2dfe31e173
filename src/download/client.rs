//! HTTP fetcher with retry, backup-URL selection and size probing.
//!
//! This module provides [`HttpClient`], the only component that talks to the
//! network. Every request goes through [`HttpClient::send`], which maps
//! transport failures and non-2xx responses onto [`DownloadError`] variants so
//! that [`classify_error`] can drive the retry schedule.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::cookie::Jar;
use reqwest::header::{CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_RANGE, HeaderMap, RANGE};
use reqwest::{Client, Method, redirect};
use tracing::{debug, instrument};

use super::constants::{CONNECT_TIMEOUT_SECS, READ_TIMEOUT_SECS};
use super::error::DownloadError;
use super::governor::{UrlScores, choose_uniform};
use super::path::parse_content_disposition;
use super::retry::{DEFAULT_STREAM_RETRY, RetryDecision, RetrySchedule, classify_error};
use crate::user_agent;

/// Construction parameters for [`HttpClient`].
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// TCP/TLS connect timeout.
    pub connect_timeout: Duration,
    /// Longest wait for the next chunk of a response. There is no
    /// whole-request deadline, so slow but steady bodies never time out.
    pub read_timeout: Duration,
    /// `user-agent` header value.
    pub user_agent: String,
    /// Extra default headers (e.g. `referer`).
    pub headers: HeaderMap,
    /// Cookie jar attached to every request.
    pub cookie_jar: Option<Arc<Jar>>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(CONNECT_TIMEOUT_SECS),
            read_timeout: Duration::from_secs(READ_TIMEOUT_SECS),
            user_agent: user_agent::default_download_user_agent(),
            headers: HeaderMap::new(),
            cookie_jar: None,
        }
    }
}

/// One logical request, possibly tried several times against several URLs.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    /// HTTP method.
    pub method: Method,
    /// Whether 3xx responses are followed.
    pub follow_redirects: bool,
    /// Per-request headers.
    pub headers: HeaderMap,
    /// Retries allowed after the first attempt.
    pub retries: u32,
}

impl Default for FetchRequest {
    fn default() -> Self {
        Self {
            method: Method::GET,
            follow_redirects: true,
            headers: HeaderMap::new(),
            retries: DEFAULT_STREAM_RETRY,
        }
    }
}

impl FetchRequest {
    /// A GET with default retries.
    #[must_use]
    pub fn get() -> Self {
        Self::default()
    }

    /// A request with the given method and default retries.
    #[must_use]
    pub fn new(method: Method) -> Self {
        Self {
            method,
            ..Self::default()
        }
    }

    /// Sets the retry count.
    #[must_use]
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    /// Disables redirect following.
    #[must_use]
    pub fn without_redirects(mut self) -> Self {
        self.follow_redirects = false;
        self
    }

    /// Adds a header. Invalid values are ignored.
    #[must_use]
    pub fn with_header(mut self, name: reqwest::header::HeaderName, value: &str) -> Self {
        if let Ok(value) = value.parse() {
            self.headers.insert(name, value);
        }
        self
    }
}

/// Result of probing a resource's size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentInfo {
    /// Resource length in bytes.
    pub total: u64,
    /// File name from `Content-Disposition`, if any.
    pub filename: Option<String>,
    /// URL after redirects.
    pub final_url: String,
}

/// HTTP client shared by every job of an engine.
///
/// Cloning is cheap; clones share the connection pool.
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Client,
    no_redirect: Client,
    retry: RetrySchedule,
}

impl HttpClient {
    /// Builds the client pair (redirect-following and not).
    ///
    /// # Errors
    ///
    /// Returns the builder error when TLS or proxy setup fails.
    #[instrument(level = "debug", skip_all)]
    pub fn new(config: &ClientConfig, retry: RetrySchedule) -> Result<Self, reqwest::Error> {
        let client = base_builder(config).build()?;
        let no_redirect = base_builder(config)
            .redirect(redirect::Policy::none())
            .build()?;
        Ok(Self {
            client,
            no_redirect,
            retry,
        })
    }

    /// The redirect-following client.
    #[must_use]
    pub fn inner(&self) -> &Client {
        &self.client
    }

    /// Retry schedule used by [`fetch`](Self::fetch).
    #[must_use]
    pub fn retry_schedule(&self) -> &RetrySchedule {
        &self.retry
    }

    /// Sends one attempt of `request` to `url`.
    ///
    /// Non-2xx responses become [`DownloadError::HttpStatus`]; 3xx responses
    /// are returned as-is when redirects are disabled.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::Timeout`], [`DownloadError::Transport`] or
    /// [`DownloadError::HttpStatus`].
    pub async fn send(
        &self,
        url: &str,
        request: &FetchRequest,
    ) -> Result<reqwest::Response, DownloadError> {
        let client = if request.follow_redirects {
            &self.client
        } else {
            &self.no_redirect
        };
        let response = client
            .request(request.method.clone(), url)
            .headers(request.headers.clone())
            .send()
            .await
            .map_err(|e| map_send_error(url, e))?;

        let status = response.status();
        let accepted =
            status.is_success() || (!request.follow_redirects && status.is_redirection());
        if !accepted {
            return Err(DownloadError::http_status(url, status.as_u16()));
        }
        Ok(response)
    }

    /// Sends `request`, retrying per the schedule and choosing among `urls`.
    ///
    /// With `scores`, each failure lowers the failed URL's score, URLs are
    /// chosen by weight and a 403 adds the forbidden back-off.
    ///
    /// # Errors
    ///
    /// Returns the last error once retries are exhausted, or immediately for
    /// unclassified failures.
    #[instrument(skip(self, request, scores), fields(method = %request.method, urls = urls.len()))]
    pub async fn fetch(
        &self,
        urls: &[String],
        request: &FetchRequest,
        scores: Option<&UrlScores>,
    ) -> Result<reqwest::Response, DownloadError> {
        self.retrying(urls, request, scores, |url| async move {
            self.send(&url, request).await
        })
        .await
    }

    /// Runs `op` against a URL chosen from `urls` until it succeeds or the
    /// retry schedule gives up.
    pub(crate) async fn retrying<T, F, Fut>(
        &self,
        urls: &[String],
        request: &FetchRequest,
        scores: Option<&UrlScores>,
        op: F,
    ) -> Result<T, DownloadError>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<T, DownloadError>>,
    {
        let mut attempt = 0;
        loop {
            let chosen = match scores {
                Some(scores) => scores.choose(urls),
                None => choose_uniform(urls),
            };
            let Some(url) = chosen else {
                return Err(DownloadError::invalid_url("<no url>"));
            };

            let error = match op(url.to_string()).await {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };

            let kind = classify_error(&error);
            if let Some(scores) = scores {
                scores.penalize(url, kind);
            }
            match self.retry.fetch_decision(kind, attempt, request.retries) {
                RetryDecision::Retry {
                    mut delay,
                    attempt: next,
                } => {
                    if scores.is_some() && kind.is_forbidden() {
                        delay += self.retry.forbidden_delay(attempt);
                    }
                    debug!(url = %url, error = %error, attempt, delay_ms = delay.as_millis(), "retrying request");
                    tokio::time::sleep(delay).await;
                    attempt = next;
                }
                RetryDecision::GiveUp { reason } => {
                    debug!(url = %url, error = %error, reason = %reason, "giving up");
                    return Err(error);
                }
            }
        }
    }

    /// Probes the size of `url`.
    ///
    /// Tries `HEAD` first. When it fails or carries no length, falls back to
    /// `GET` with `Range: bytes=0-1` and reads the `Content-Range` total.
    ///
    /// # Errors
    ///
    /// Returns the fallback request's error, or
    /// [`DownloadError::MissingContentLength`] if neither reports a size.
    #[instrument(skip(self))]
    pub async fn content_length(&self, url: &str) -> Result<ContentInfo, DownloadError> {
        match self.send(url, &FetchRequest::new(Method::HEAD)).await {
            Ok(response) => {
                if let Some(total) = header_u64(response.headers(), CONTENT_LENGTH) {
                    return Ok(ContentInfo {
                        total,
                        filename: disposition_filename(response.headers()),
                        final_url: response.url().to_string(),
                    });
                }
                debug!(url = %url, "HEAD without length, probing with range request");
            }
            Err(error) => debug!(url = %url, error = %error, "HEAD failed, probing with range request"),
        }

        let request = FetchRequest::get().with_header(RANGE, "bytes=0-1");
        let response = self.fetch(&[url.to_string()], &request, None).await?;
        let headers = response.headers();
        let total = headers
            .get(CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_content_range_total)
            .or_else(|| {
                (response.status().as_u16() == 200)
                    .then(|| header_u64(headers, CONTENT_LENGTH))
                    .flatten()
            })
            .ok_or_else(|| DownloadError::MissingContentLength {
                url: url.to_string(),
            })?;
        Ok(ContentInfo {
            total,
            filename: disposition_filename(headers),
            final_url: response.url().to_string(),
        })
    }

    /// GETs `url` as text, with default retries.
    ///
    /// # Errors
    ///
    /// Returns the request error or a transport error while reading the body.
    pub async fn get_text(&self, url: &str) -> Result<String, DownloadError> {
        self.get_text_with(url, &FetchRequest::get()).await
    }

    /// GETs `url` as text with a custom request.
    ///
    /// # Errors
    ///
    /// Same as [`get_text`](Self::get_text).
    pub async fn get_text_with(
        &self,
        url: &str,
        request: &FetchRequest,
    ) -> Result<String, DownloadError> {
        self.retrying(&[url.to_string()], request, None, |url| async move {
            let response = self.send(&url, request).await?;
            response
                .text()
                .await
                .map_err(|e| map_send_error(&url, e))
        })
        .await
    }

    /// GETs `url` as bytes, with default retries.
    ///
    /// # Errors
    ///
    /// Returns the request error or a transport error while reading the body.
    pub async fn get_bytes(&self, url: &str) -> Result<Vec<u8>, DownloadError> {
        let request = FetchRequest::get();
        self.retrying(&[url.to_string()], &request, None, |url| {
            let request = &request;
            async move {
                let response = self.send(&url, request).await?;
                read_body(response, &url).await
            }
        })
        .await
    }
}

/// Reads a whole response body.
pub(crate) async fn read_body(
    response: reqwest::Response,
    url: &str,
) -> Result<Vec<u8>, DownloadError> {
    let mut body = Vec::new();
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| map_send_error(url, e))?;
        body.extend_from_slice(&chunk);
    }
    Ok(body)
}

pub(crate) fn map_send_error(url: &str, error: reqwest::Error) -> DownloadError {
    if error.is_timeout() {
        DownloadError::timeout(url)
    } else if error.is_builder() {
        DownloadError::invalid_url(url)
    } else {
        DownloadError::transport(url, error)
    }
}

fn base_builder(config: &ClientConfig) -> reqwest::ClientBuilder {
    let mut builder = Client::builder()
        .connect_timeout(config.connect_timeout)
        .read_timeout(config.read_timeout)
        .gzip(true)
        .user_agent(config.user_agent.clone())
        .default_headers(config.headers.clone());
    if let Some(jar) = &config.cookie_jar {
        builder = builder.cookie_provider(Arc::clone(jar));
    }
    builder
}

fn header_u64(headers: &HeaderMap, name: reqwest::header::HeaderName) -> Option<u64> {
    headers.get(name)?.to_str().ok()?.trim().parse().ok()
}

fn disposition_filename(headers: &HeaderMap) -> Option<String> {
    headers
        .get(CONTENT_DISPOSITION)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_content_disposition)
}

/// Reads the total from a `Content-Range` value (`bytes 0-1/12345`).
#[must_use]
pub fn parse_content_range_total(value: &str) -> Option<u64> {
    let (_, total) = value.rsplit_once('/')?;
    total.trim().parse().ok()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, Request, ResponseTemplate};

    fn client() -> HttpClient {
        HttpClient::new(&ClientConfig::default(), RetrySchedule::immediate()).unwrap()
    }

    /// Serves `body` one byte at a time, pausing `pause` between bytes.
    async fn trickle_server(body: &'static [u8], pause: Duration) -> String {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut request = [0u8; 1024];
                    let _ = socket.read(&mut request).await;
                    let head = format!(
                        "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                        body.len()
                    );
                    socket.write_all(head.as_bytes()).await.unwrap();
                    for byte in body {
                        socket.write_all(std::slice::from_ref(byte)).await.unwrap();
                        socket.flush().await.unwrap();
                        tokio::time::sleep(pause).await;
                    }
                });
            }
        });
        format!("http://{addr}/slow")
    }

    #[tokio::test]
    async fn test_read_timeout_is_per_read_not_per_request() {
        let url = trickle_server(b"steady", Duration::from_millis(150)).await;
        let config = ClientConfig {
            read_timeout: Duration::from_millis(500),
            ..ClientConfig::default()
        };
        let client = HttpClient::new(&config, RetrySchedule::immediate()).unwrap();

        // six reads spread over about 900 ms, none slower than the timeout
        let body = client.get_bytes(&url).await.unwrap();
        assert_eq!(body, b"steady");
    }

    #[test]
    fn test_parse_content_range_total() {
        assert_eq!(parse_content_range_total("bytes 0-1/12345"), Some(12345));
        assert_eq!(parse_content_range_total("bytes 0-1/*"), None);
        assert_eq!(parse_content_range_total("garbage"), None);
    }

    #[tokio::test]
    async fn test_fetch_retries_status_errors_then_succeeds() {
        let mock_server = MockServer::start().await;
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        Mock::given(method("GET"))
            .and(path("/flaky"))
            .respond_with(move |_: &Request| {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    ResponseTemplate::new(503)
                } else {
                    ResponseTemplate::new(200).set_body_string("ok")
                }
            })
            .mount(&mock_server)
            .await;

        let url = format!("{}/flaky", mock_server.uri());
        let response = client()
            .fetch(&[url], &FetchRequest::get(), None)
            .await
            .unwrap();
        assert_eq!(response.text().await.unwrap(), "ok");
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_fetch_returns_last_status_after_retries() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/gone"))
            .respond_with(ResponseTemplate::new(404))
            .expect(3)
            .mount(&mock_server)
            .await;

        let url = format!("{}/gone", mock_server.uri());
        let result = client()
            .fetch(&[url], &FetchRequest::get().with_retries(2), None)
            .await;
        assert!(matches!(
            result,
            Err(DownloadError::HttpStatus { status: 404, .. })
        ));
    }

    #[tokio::test]
    async fn test_fetch_penalizes_failing_url() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/bad"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&mock_server)
            .await;

        let url = format!("{}/bad", mock_server.uri());
        let scores = UrlScores::new(10, 5);
        let _ = client()
            .fetch(
                &[url.clone()],
                &FetchRequest::get().with_retries(1),
                Some(&scores),
            )
            .await;
        assert_eq!(scores.score(&url), 25 - 8);
    }

    #[tokio::test]
    async fn test_fetch_without_redirects_returns_location() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/short"))
            .respond_with(
                ResponseTemplate::new(302).insert_header("location", "https://www.example.com/video/1"),
            )
            .mount(&mock_server)
            .await;

        let url = format!("{}/short", mock_server.uri());
        let response = client()
            .fetch(&[url], &FetchRequest::get().without_redirects(), None)
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 302);
        assert_eq!(
            response.headers().get("location").unwrap(),
            "https://www.example.com/video/1"
        );
    }

    #[tokio::test]
    async fn test_content_length_falls_back_to_range_probe() {
        let mock_server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/file.bin"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&mock_server)
            .await;
        Mock::given(method("GET"))
            .and(path("/file.bin"))
            .and(header("range", "bytes=0-1"))
            .respond_with(
                ResponseTemplate::new(206)
                    .insert_header("content-range", "bytes 0-1/4096")
                    .insert_header("content-disposition", r#"attachment; filename="real.bin""#)
                    .set_body_bytes(vec![0u8; 2]),
            )
            .mount(&mock_server)
            .await;

        let url = format!("{}/file.bin", mock_server.uri());
        let info = client().content_length(&url).await.unwrap();
        assert_eq!(info.total, 4096);
        assert_eq!(info.filename.as_deref(), Some("real.bin"));
        assert_eq!(info.final_url, url);
    }

    #[tokio::test]
    async fn test_get_text_and_bytes() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/t"))
            .respond_with(ResponseTemplate::new(200).set_body_string("hello"))
            .mount(&mock_server)
            .await;

        let url = format!("{}/t", mock_server.uri());
        let client = client();
        assert_eq!(client.get_text(&url).await.unwrap(), "hello");
        assert_eq!(client.get_bytes(&url).await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn test_empty_url_list_is_an_error() {
        let result = client().fetch(&[], &FetchRequest::get(), None).await;
        assert!(matches!(result, Err(DownloadError::InvalidUrl { .. })));
    }
}
