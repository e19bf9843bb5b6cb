// Direct HTTP fetching for pages, external scripts and source maps.
//
// Redirects are followed manually so the SSRF policy re-validates every hop
// with its resolved absolute URL; the client itself never auto-redirects.

use std::collections::HashMap;
use std::time::Duration;

use reqwest::header::{HeaderMap, ACCEPT_ENCODING, LOCATION};
use url::Url;

use crate::error::AppError;
use crate::security;

/// A browser-like User-Agent: plenty of origins serve different (or no)
/// content to obvious bots.
pub const BROWSER_USER_AGENT: &str =
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// Response bodies above this are rejected outright.
pub const MAX_BODY_BYTES: usize = 5 * 1024 * 1024;

const MAX_REDIRECTS: usize = 5;

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub final_url: Url,
    pub status: u16,
    /// Lower-cased header map; repeated headers newline-joined.
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn body_string(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

pub struct SsrfHttpClient {
    http: reqwest::Client,
}

impl SsrfHttpClient {
    pub fn new(timeout: Duration) -> Result<Self, AppError> {
        let http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .timeout(timeout)
            .user_agent(BROWSER_USER_AGENT)
            .build()
            .map_err(AppError::Http)?;
        Ok(Self { http })
    }

    /// GET a URL with per-hop SSRF validation, bounded body size and
    /// identity transfer encoding.
    pub async fn fetch(
        &self,
        url: &str,
        extra_headers: &HashMap<String, String>,
        timeout: Duration,
    ) -> Result<FetchedResponse, AppError> {
        let mut current = security::validate_target_url(url).await?;

        for _hop in 0..=MAX_REDIRECTS {
            let mut request = self
                .http
                .get(current.clone())
                .timeout(timeout)
                .header(ACCEPT_ENCODING, "identity");
            for (name, value) in extra_headers {
                request = request.header(name.as_str(), value.as_str());
            }

            let response = request.send().await?;
            let status = response.status();

            if status.is_redirection() {
                let location = response
                    .headers()
                    .get(LOCATION)
                    .and_then(|v| v.to_str().ok())
                    .ok_or_else(|| {
                        AppError::Render(format!("redirect from {} without Location", current))
                    })?;
                let next = current
                    .join(location)
                    .map_err(|_| AppError::Render(format!("invalid redirect target: {}", location)))?;
                // Re-run the full policy against the resolved absolute URL.
                current = security::validate_target_url(next.as_str()).await?;
                continue;
            }

            if let Some(len) = response.content_length() {
                if len as usize > MAX_BODY_BYTES {
                    return Err(AppError::Render(format!(
                        "response body too large: {} bytes from {}",
                        len, current
                    )));
                }
            }

            let headers = header_map_to_lower(response.headers());
            let final_url = current.clone();
            let status_code = status.as_u16();
            let body = response.bytes().await?;
            if body.len() > MAX_BODY_BYTES {
                return Err(AppError::Render(format!(
                    "response body too large: {} bytes from {}",
                    body.len(),
                    final_url
                )));
            }

            return Ok(FetchedResponse {
                final_url,
                status: status_code,
                headers,
                body: body.to_vec(),
            });
        }

        Err(AppError::Render(format!(
            "too many redirects fetching {}",
            url
        )))
    }

    /// Fetch with one extra attempt, used for external script bodies.
    pub async fn fetch_with_retry(
        &self,
        url: &str,
        extra_headers: &HashMap<String, String>,
        timeout: Duration,
    ) -> Result<FetchedResponse, AppError> {
        match self.fetch(url, extra_headers, timeout).await {
            Ok(response) => Ok(response),
            Err(first) => {
                tracing::warn!("Fetch of {} failed, retrying once: {}", url, first);
                self.fetch(url, extra_headers, timeout).await
            }
        }
    }
}

/// Lower-case header names; join repeated values (Set-Cookie) with newlines.
pub fn header_map_to_lower(headers: &HeaderMap) -> HashMap<String, String> {
    let mut map: HashMap<String, String> = HashMap::new();
    for (name, value) in headers {
        let Ok(value) = value.to_str() else { continue };
        let key = name.as_str().to_ascii_lowercase();
        match map.get_mut(&key) {
            Some(existing) => {
                existing.push('\n');
                existing.push_str(value);
            }
            None => {
                map.insert(key, value.to_string());
            }
        }
    }
    map
}
