// Page rendering and extraction. The direct HTTP fetch always runs first
// (it is what captures response headers and status); when JavaScript
// rendering is requested and Chrome is available, the DOM snapshot is
// replaced with the browser-rendered document.

pub mod chrome;
pub mod fetch;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::AppError;
use crate::models::ScanParameters;
use chrome::ChromeRenderer;
use fetch::{FetchedResponse, SsrfHttpClient};

/// Crawl hard cap, regardless of the requested depth.
pub const MAX_CRAWL_PAGES: usize = 100;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InlineScript {
    pub content: String,
    #[serde(default)]
    pub attributes: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalScript {
    /// Absolute URL, resolved against the page it was found on.
    pub url: String,
    #[serde(default)]
    pub attributes: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkResource {
    pub url: String,
    pub resource_type: String,
    pub method: String,
    pub status: u16,
    pub size: usize,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    pub duration_ms: u64,
}

/// Everything the render stage hands to analysis about the page itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderOutcome {
    pub page_url: String,
    pub final_url: String,
    pub status: u16,
    /// Lower-cased response headers of the top-level document.
    pub headers: HashMap<String, String>,
    /// Final DOM HTML of the target page.
    #[serde(skip)]
    pub html: String,
    pub inline_scripts: Vec<InlineScript>,
    pub external_scripts: Vec<ExternalScript>,
    /// Absolute source-map URL -> raw map JSON.
    pub source_maps: HashMap<String, String>,
    pub resources: Vec<NetworkResource>,
    pub pages_crawled: usize,
}

pub struct Renderer {
    fetcher: SsrfHttpClient,
    chrome: Arc<ChromeRenderer>,
}

impl Renderer {
    pub fn new() -> Result<Self, AppError> {
        Ok(Self {
            fetcher: SsrfHttpClient::new(Duration::from_secs(20))?,
            chrome: Arc::new(ChromeRenderer::new()),
        })
    }

    pub fn fetcher(&self) -> &SsrfHttpClient {
        &self.fetcher
    }

    /// Render the target page (and, when depth > 0, a bounded same-origin
    /// crawl), collecting scripts and resources from every visited page.
    pub async fn render(&self, url: &str, params: &ScanParameters) -> Result<RenderOutcome, AppError> {
        let page_timeout = Duration::from_secs(params.timeout.clamp(5, 120));
        let root = self
            .fetcher
            .fetch(url, &params.headers, page_timeout)
            .await?;

        let mut html = root.body_string();

        // Browser-rendered DOM replaces the static body when requested; the
        // response headers always come from the direct fetch.
        if params.render_java_script {
            match Arc::clone(&self.chrome)
                .render_dom(root.final_url.as_str(), params.user_agent.clone(), page_timeout)
                .await
            {
                Ok(rendered) => html = rendered,
                Err(e) => {
                    tracing::warn!(
                        "JavaScript rendering unavailable for {}, using static DOM: {}",
                        root.final_url,
                        e
                    );
                }
            }
        }

        let root_page = extract_page(&html, &root.final_url);
        let mut outcome = RenderOutcome {
            page_url: url.to_string(),
            final_url: root.final_url.to_string(),
            status: root.status,
            headers: root.headers.clone(),
            html,
            inline_scripts: root_page.inline_scripts,
            external_scripts: root_page.external_scripts,
            source_maps: HashMap::new(),
            resources: vec![resource_record(&root, "document")],
            pages_crawled: 1,
        };

        if params.depth > 0 {
            self.crawl(
                &root.final_url,
                root_page.links,
                params,
                page_timeout,
                &mut outcome,
            )
            .await;
        }

        Ok(outcome)
    }

    /// Breadth-first same-origin crawl under `MAX_CRAWL_PAGES`. Crawl
    /// failures are logged and skipped; they never fail the scan.
    async fn crawl(
        &self,
        origin: &Url,
        seed_links: Vec<Url>,
        params: &ScanParameters,
        page_timeout: Duration,
        outcome: &mut RenderOutcome,
    ) {
        let mut visited: HashSet<String> = HashSet::new();
        visited.insert(origin.to_string());

        let mut frontier: VecDeque<(Url, u32)> =
            seed_links.into_iter().map(|link| (link, 1)).collect();
        let mut seen_scripts: HashSet<String> = outcome
            .external_scripts
            .iter()
            .map(|s| s.url.clone())
            .collect();

        while let Some((link, depth)) = frontier.pop_front() {
            if outcome.pages_crawled >= MAX_CRAWL_PAGES || depth > params.depth {
                break;
            }
            if link.host_str() != origin.host_str() {
                continue;
            }
            if !visited.insert(link.to_string()) {
                continue;
            }

            let page = match self
                .fetcher
                .fetch(link.as_str(), &params.headers, page_timeout)
                .await
            {
                Ok(page) => page,
                Err(e) => {
                    tracing::warn!("Crawl fetch of {} failed: {}", link, e);
                    continue;
                }
            };

            outcome.pages_crawled += 1;
            outcome.resources.push(resource_record(&page, "document"));

            let extracted = extract_page(&page.body_string(), &page.final_url);
            for script in extracted.external_scripts {
                if seen_scripts.insert(script.url.clone()) {
                    outcome.external_scripts.push(script);
                }
            }
            outcome.inline_scripts.extend(extracted.inline_scripts);

            if depth < params.depth {
                for next in extracted.links {
                    frontier.push_back((next, depth + 1));
                }
            }
        }
    }
}

fn resource_record(response: &FetchedResponse, resource_type: &str) -> NetworkResource {
    NetworkResource {
        url: response.final_url.to_string(),
        resource_type: resource_type.to_string(),
        method: "GET".to_string(),
        status: response.status,
        size: response.body.len(),
        headers: response.headers.clone(),
        duration_ms: 0,
    }
}

// ============================================
// DOM extraction
// ============================================

struct ExtractedPage {
    inline_scripts: Vec<InlineScript>,
    external_scripts: Vec<ExternalScript>,
    links: Vec<Url>,
}

/// Pull scripts and same-document links out of an HTML body. Synchronous:
/// the parsed DOM never crosses an await point.
fn extract_page(html: &str, base: &Url) -> ExtractedPage {
    let doc = Html::parse_document(html);
    let script_sel = Selector::parse("script").expect("valid selector");
    let link_sel = Selector::parse("a[href]").expect("valid selector");

    let mut inline_scripts = Vec::new();
    let mut external_scripts = Vec::new();

    for script in doc.select(&script_sel) {
        let el = script.value();
        let attributes: HashMap<String, String> = el
            .attrs()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();

        match el.attr("src") {
            Some(src) => {
                let Ok(resolved) = base.join(src) else {
                    continue;
                };
                if resolved.scheme() == "http" || resolved.scheme() == "https" {
                    external_scripts.push(ExternalScript {
                        url: resolved.to_string(),
                        attributes,
                    });
                }
            }
            None => {
                let content: String = script.text().collect();
                if !content.trim().is_empty() {
                    inline_scripts.push(InlineScript {
                        content,
                        attributes,
                    });
                }
            }
        }
    }

    let links = doc
        .select(&link_sel)
        .filter_map(|a| a.value().attr("href"))
        .filter_map(|href| base.join(href).ok())
        .filter(|u| u.scheme() == "http" || u.scheme() == "https")
        .map(|mut u| {
            u.set_fragment(None);
            u
        })
        .collect();

    ExtractedPage {
        inline_scripts,
        external_scripts,
        links,
    }
}

/// Trailing `//# sourceMappingURL=` reference in a script body, resolved
/// against the script's URL. Data URIs are ignored.
pub fn source_map_url(script_body: &str, script_url: &str) -> Option<Url> {
    let marker = "sourceMappingURL=";
    let tail: String = script_body
        .lines()
        .rev()
        .take(5)
        .collect::<Vec<_>>()
        .join("\n");
    let idx = tail.rfind(marker)?;
    let raw = tail[idx + marker.len()..]
        .split_whitespace()
        .next()?
        .trim_end_matches("*/");
    if raw.starts_with("data:") {
        return None;
    }
    let base = Url::parse(script_url).ok()?;
    let resolved = base.join(raw).ok()?;
    if resolved.scheme() == "http" || resolved.scheme() == "https" {
        Some(resolved)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Url {
        Url::parse("https://example.com/app/").unwrap()
    }

    #[test]
    fn extracts_inline_and_external_scripts() {
        let html = r#"
            <html><head>
                <script src="/static/app.js" integrity="sha384-x"></script>
                <script src="https://cdn.example.net/lib.js"></script>
                <script>var inline = 1;</script>
                <script> </script>
            </head></html>
        "#;
        let page = extract_page(html, &base());
        assert_eq!(page.external_scripts.len(), 2);
        assert_eq!(page.external_scripts[0].url, "https://example.com/static/app.js");
        assert_eq!(
            page.external_scripts[0].attributes.get("integrity").unwrap(),
            "sha384-x"
        );
        assert_eq!(page.inline_scripts.len(), 1);
        assert_eq!(page.inline_scripts[0].content.trim(), "var inline = 1;");
    }

    #[test]
    fn extracts_links_resolved_and_defragmented() {
        let html = r#"
            <a href="/about#team">About</a>
            <a href="mailto:x@example.com">Mail</a>
            <a href="page2.html">Next</a>
        "#;
        let page = extract_page(html, &base());
        let urls: Vec<String> = page.links.iter().map(|u| u.to_string()).collect();
        assert_eq!(
            urls,
            vec![
                "https://example.com/about".to_string(),
                "https://example.com/app/page2.html".to_string(),
            ]
        );
    }

    #[test]
    fn source_map_trailer_resolves_relative() {
        let body = "var a=1;\n//# sourceMappingURL=app.js.map\n";
        let url = source_map_url(body, "https://example.com/static/app.js").unwrap();
        assert_eq!(url.as_str(), "https://example.com/static/app.js.map");
    }

    #[test]
    fn source_map_data_uri_is_ignored() {
        let body = "//# sourceMappingURL=data:application/json;base64,eyJ2IjozfQ==";
        assert!(source_map_url(body, "https://example.com/a.js").is_none());
    }

    #[test]
    fn source_map_absent_is_none() {
        assert!(source_map_url("var a = 1;", "https://example.com/a.js").is_none());
    }

    #[test]
    fn css_style_map_comment_is_handled() {
        let body = "var x;\n/*# sourceMappingURL=style.css.map */";
        let url = source_map_url(body, "https://example.com/css/style.css").unwrap();
        assert_eq!(url.as_str(), "https://example.com/css/style.css.map");
    }
}
