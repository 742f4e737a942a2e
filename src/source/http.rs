//! HTTP(S) source adapter.
//!
//! Probes with HEAD and falls back to a one-byte ranged GET when the server
//! rejects HEAD or omits the length. Download is a streaming GET; when the
//! task carries a speed cap the stream is wrapped in a token-bucket limiter
//! whose chunks are capped at ~1/10 second of budget, keeping pause/cancel
//! latency at the capped rate under 100 ms.

use bytes::Bytes;
use futures::{ready, Stream, StreamExt};
use percent_encoding::percent_decode_str;
use reqwest::header::{HeaderMap, CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, RANGE};
use reqwest::{Client, RequestBuilder, StatusCode};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::time::{Instant, Sleep};
use tracing::debug;
use url::Url;

use super::{
    AuthConfig, AuthKind, ByteStream, DownloadOptions, Downloader, FileMetadata, Result,
    SourceError,
};

/// HTTP client configuration.
#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub user_agent: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            user_agent: concat!("loadvault/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

pub struct HttpDownloader {
    client: Client,
}

impl HttpDownloader {
    pub fn new(config: HttpConfig) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .user_agent(&config.user_agent)
            .build()
            .map_err(|e| SourceError::RequestFailed(e.to_string()))?;
        Ok(Self { client })
    }

    async fn probe_with_ranged_get(
        &self,
        url: &str,
        auth: Option<&AuthConfig>,
    ) -> Result<FileMetadata> {
        let request = apply_auth(self.client.get(url).header(RANGE, "bytes=0-0"), auth);
        let resp = request.send().await.map_err(map_reqwest_error)?;

        let status = resp.status();
        if status != StatusCode::PARTIAL_CONTENT && !status.is_success() {
            return Err(SourceError::UnexpectedStatus {
                method: "GET",
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let total = resp
            .headers()
            .get(CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_total_from_content_range)
            .unwrap_or(-1);

        Ok(FileMetadata {
            file_name: pick_file_name(header_str(resp.headers(), CONTENT_DISPOSITION), url),
            file_size: total,
            content_type: header_str(resp.headers(), CONTENT_TYPE)
                .unwrap_or_default()
                .to_string(),
            headers: clone_headers(resp.headers()),
        })
    }
}

#[async_trait::async_trait]
impl Downloader for HttpDownloader {
    async fn download(
        &self,
        url: &str,
        auth: Option<&AuthConfig>,
        opts: &DownloadOptions,
    ) -> Result<(ByteStream, i64)> {
        let mut request = apply_auth(self.client.get(url), auth);
        if opts.timeout > Duration::ZERO {
            request = request.timeout(opts.timeout);
        }

        let resp = request.send().await.map_err(map_reqwest_error)?;
        let status = resp.status();
        if !status.is_success() {
            return Err(SourceError::UnexpectedStatus {
                method: "GET",
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let total = resp
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(-1);

        debug!(url, total, "source stream opened");

        let stream: ByteStream =
            Box::pin(resp.bytes_stream().map(|chunk| chunk.map_err(std::io::Error::other)));

        let stream = if opts.max_speed > 0 {
            Box::pin(RateLimitedStream::new(stream, opts.max_speed)) as ByteStream
        } else {
            stream
        };

        Ok((stream, total))
    }

    async fn get_file_info(&self, url: &str, auth: Option<&AuthConfig>) -> Result<FileMetadata> {
        let head = apply_auth(self.client.head(url), auth).send().await;

        let resp = match head {
            // Servers that reject HEAD outright get the ranged-GET probe.
            Err(_) => return self.probe_with_ranged_get(url, auth).await,
            Ok(resp)
                if resp.status() == StatusCode::METHOD_NOT_ALLOWED
                    || resp.status() == StatusCode::NOT_FOUND =>
            {
                return self.probe_with_ranged_get(url, auth).await;
            }
            Ok(resp) => resp,
        };

        let status = resp.status();
        if !status.is_success() {
            return Err(SourceError::UnexpectedStatus {
                method: "HEAD",
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let file_name = pick_file_name(header_str(resp.headers(), CONTENT_DISPOSITION), url);
        let size = resp
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<i64>().ok());

        let metadata = FileMetadata {
            file_name: file_name.clone(),
            file_size: size.unwrap_or(-1),
            content_type: header_str(resp.headers(), CONTENT_TYPE)
                .unwrap_or_default()
                .to_string(),
            headers: clone_headers(resp.headers()),
        };

        if size.is_some() {
            return Ok(metadata);
        }

        // Some servers omit Content-Length on HEAD; the ranged probe is the
        // last resort for the size. The HEAD-derived filename wins.
        match self.probe_with_ranged_get(url, auth).await {
            Ok(mut probed) => {
                probed.file_name = file_name;
                Ok(probed)
            }
            Err(_) => Ok(metadata),
        }
    }

    fn supports_resume(&self) -> bool {
        // The protocol supports Range requests; actual server capability
        // surfaces in the probe's Accept-Ranges/Content-Range headers.
        true
    }
}

fn map_reqwest_error(e: reqwest::Error) -> SourceError {
    if e.is_timeout() {
        SourceError::Timeout
    } else if e.is_builder() {
        SourceError::InvalidUrl(e.to_string())
    } else {
        SourceError::RequestFailed(e.to_string())
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: reqwest::header::HeaderName) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn clone_headers(headers: &HeaderMap) -> HashMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.to_string(), v.to_string()))
        })
        .collect()
}

/// Apply auth config to an outgoing request. An unspecified kind is inferred
/// from which fields are present.
fn apply_auth(mut request: RequestBuilder, auth: Option<&AuthConfig>) -> RequestBuilder {
    let Some(auth) = auth else {
        return request;
    };

    for (name, value) in &auth.headers {
        if name.is_empty() || value.is_empty() {
            continue;
        }
        request = request.header(name.as_str(), value.as_str());
    }

    let username = auth.username.as_deref().unwrap_or_default();
    let password = auth.password.as_deref().unwrap_or_default();
    let token = auth.token.as_deref().unwrap_or_default();

    match auth.kind {
        AuthKind::Basic => {
            if !username.is_empty() || !password.is_empty() {
                request = request.basic_auth(username, Some(password));
            }
        }
        AuthKind::Bearer | AuthKind::Token => {
            if !token.is_empty() {
                request = request.bearer_auth(token);
            }
        }
        AuthKind::Unspecified => {
            if !username.is_empty() || !password.is_empty() {
                request = request.basic_auth(username, Some(password));
            } else if !token.is_empty() {
                request = request.bearer_auth(token);
            }
        }
    }

    request
}

/// Filename resolution order: RFC 5987 `filename*`, quoted `filename`, URL
/// path basename, then a fixed fallback.
fn pick_file_name(content_disposition: Option<&str>, raw_url: &str) -> String {
    if let Some(disposition) = content_disposition {
        let lower = disposition.to_ascii_lowercase();

        if let Some(idx) = lower.find("filename*=") {
            let mut value = &disposition[idx + "filename*=".len()..];
            if let Some(end) = value.find(';') {
                value = &value[..end];
            }
            // Expect UTF-8''<percent-encoded>
            if let Some(sep) = value.find("''") {
                let encoded = value[sep + 2..].trim().trim_matches('"');
                if let Ok(decoded) = percent_decode_str(encoded).decode_utf8() {
                    if !decoded.is_empty() {
                        return decoded.into_owned();
                    }
                }
            }
        }

        if let Some(idx) = lower.find("filename=") {
            let mut value = disposition[idx + "filename=".len()..].trim();
            if let Some(end) = value.find(';') {
                value = value[..end].trim();
            }
            let value = value.trim_matches('"');
            if !value.is_empty() {
                return value.to_string();
            }
        }
    }

    let basename = Url::parse(raw_url).ok().and_then(|u| {
        u.path_segments()
            .and_then(|mut segments| segments.next_back().map(str::to_string))
    });

    match basename {
        Some(name) if !name.is_empty() && name != "." => name,
        _ => "download".to_string(),
    }
}

/// Total size out of `Content-Range: bytes 0-0/<total>`.
fn parse_total_from_content_range(value: &str) -> Option<i64> {
    let value = value.trim();
    if !value.to_ascii_lowercase().starts_with("bytes") {
        return None;
    }
    let total = value.rsplit('/').next()?;
    total.parse::<i64>().ok()
}

pin_project_lite::pin_project! {
    /// Token-bucket throttle over a byte stream.
    ///
    /// The bucket holds one second of budget; chunks larger than 1/10 second
    /// of budget are split so downstream wrappers observe the stream at a
    /// bounded cadence.
    struct RateLimitedStream {
        inner: ByteStream,
        bps: f64,
        chunk_cap: usize,
        tokens: f64,
        last_refill: Instant,
        queued: VecDeque<Bytes>,
        #[pin]
        sleep: Option<Sleep>,
    }
}

impl RateLimitedStream {
    fn new(inner: ByteStream, bytes_per_second: u64) -> Self {
        let bps = bytes_per_second as f64;
        Self {
            inner,
            bps,
            chunk_cap: (bytes_per_second / 10).max(1) as usize,
            tokens: bps,
            last_refill: Instant::now(),
            queued: VecDeque::new(),
            sleep: None,
        }
    }
}

impl Stream for RateLimitedStream {
    type Item = std::io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();

        loop {
            if let Some(sleep) = this.sleep.as_mut().as_pin_mut() {
                ready!(sleep.poll(cx));
                this.sleep.set(None);
            }

            let now = Instant::now();
            let elapsed = now.duration_since(*this.last_refill).as_secs_f64();
            *this.tokens = (*this.tokens + elapsed * *this.bps).min(*this.bps);
            *this.last_refill = now;

            let mut chunk = match this.queued.pop_front() {
                Some(chunk) => chunk,
                None => match ready!(this.inner.as_mut().poll_next(cx)) {
                    Some(Ok(chunk)) => chunk,
                    other => return Poll::Ready(other),
                },
            };

            if chunk.is_empty() {
                continue;
            }

            if chunk.len() > *this.chunk_cap {
                let tail = chunk.split_off(*this.chunk_cap);
                this.queued.push_front(tail);
            }

            let need = chunk.len() as f64;
            if *this.tokens >= need {
                *this.tokens -= need;
                return Poll::Ready(Some(Ok(chunk)));
            }

            let deficit = need - *this.tokens;
            let wait = Duration::from_secs_f64(deficit / *this.bps);
            this.queued.push_front(chunk);
            this.sleep.set(Some(tokio::time::sleep(wait)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    #[test]
    fn filename_prefers_rfc5987() {
        let name = pick_file_name(
            Some("attachment; filename=\"plain.txt\"; filename*=UTF-8''na%C3%AFve%20file.txt"),
            "https://example.com/ignored.bin",
        );
        assert_eq!(name, "naïve file.txt");
    }

    #[test]
    fn filename_falls_back_to_quoted() {
        let name = pick_file_name(
            Some("attachment; filename=\"report.pdf\""),
            "https://example.com/x",
        );
        assert_eq!(name, "report.pdf");
    }

    #[test]
    fn filename_falls_back_to_url_basename() {
        let name = pick_file_name(None, "https://example.com/files/archive.tar.gz?sig=abc");
        assert_eq!(name, "archive.tar.gz");
    }

    #[test]
    fn filename_final_fallback() {
        assert_eq!(pick_file_name(None, "https://example.com/"), "download");
        assert_eq!(pick_file_name(None, "not a url"), "download");
    }

    #[test]
    fn content_range_total() {
        assert_eq!(
            parse_total_from_content_range("bytes 0-0/12345"),
            Some(12345)
        );
        assert_eq!(parse_total_from_content_range("bytes 0-0/*"), None);
        assert_eq!(parse_total_from_content_range("items 0-0/5"), None);
    }

    #[test]
    fn auth_application() {
        let client = Client::new();

        let basic = AuthConfig {
            kind: AuthKind::Basic,
            username: Some("u".into()),
            password: Some("p".into()),
            ..Default::default()
        };
        let req = apply_auth(client.get("http://example.com/"), Some(&basic))
            .build()
            .unwrap();
        let value = req.headers().get("authorization").unwrap().to_str().unwrap();
        assert!(value.starts_with("Basic "));

        let bearer = AuthConfig {
            kind: AuthKind::Token,
            token: Some("sekrit".into()),
            ..Default::default()
        };
        let req = apply_auth(client.get("http://example.com/"), Some(&bearer))
            .build()
            .unwrap();
        assert_eq!(
            req.headers().get("authorization").unwrap().to_str().unwrap(),
            "Bearer sekrit"
        );

        // Unspecified kind infers bearer from a lone token.
        let inferred = AuthConfig {
            token: Some("t".into()),
            ..Default::default()
        };
        let req = apply_auth(client.get("http://example.com/"), Some(&inferred))
            .build()
            .unwrap();
        assert_eq!(
            req.headers().get("authorization").unwrap().to_str().unwrap(),
            "Bearer t"
        );

        let extra = AuthConfig {
            headers: [("x-api-key".to_string(), "k".to_string())].into(),
            ..Default::default()
        };
        let req = apply_auth(client.get("http://example.com/"), Some(&extra))
            .build()
            .unwrap();
        assert_eq!(req.headers().get("x-api-key").unwrap().to_str().unwrap(), "k");
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limiter_caps_chunk_size() {
        let big = Bytes::from(vec![7u8; 64]);
        let inner: ByteStream = Box::pin(stream::iter(vec![Ok::<_, std::io::Error>(big)]));
        let mut limited = Box::pin(RateLimitedStream::new(inner, 100));

        let mut sizes = Vec::new();
        while let Some(chunk) = limited.next().await {
            sizes.push(chunk.unwrap().len());
        }

        // 100 B/s caps chunks at 10 bytes.
        assert_eq!(sizes.iter().sum::<usize>(), 64);
        assert!(sizes.iter().all(|&s| s <= 10));
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limiter_spends_budget_over_time() {
        let inner: ByteStream = Box::pin(stream::iter(vec![
            Ok::<_, std::io::Error>(Bytes::from(vec![0u8; 50])),
            Ok(Bytes::from(vec![1u8; 50])),
        ]));
        let mut limited = Box::pin(RateLimitedStream::new(inner, 50));

        let started = Instant::now();
        let mut total = 0;
        while let Some(chunk) = limited.next().await {
            total += chunk.unwrap().len();
        }

        assert_eq!(total, 100);
        // 100 bytes at 50 B/s with a full initial bucket: ~1s of waiting.
        assert!(started.elapsed() >= Duration::from_millis(900));
    }
}
