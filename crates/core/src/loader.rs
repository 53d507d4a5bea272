use crate::error::{FetchError, LoadError};
use crate::traits::DocumentLoader;
use crate::SourceDocument;
use async_trait::async_trait;
use chrono::Utc;
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use scraper::{ElementRef, Html, Node, Selector};
use std::time::Duration;
use tracing::debug;
use url::Url;

const USER_AGENT: &str = concat!("pageqa/", env!("CARGO_PKG_VERSION"));

const SKIPPED_TAGS: [&str; 9] = [
    "script", "style", "template", "noscript", "svg", "nav", "aside", "form", "iframe",
];

/// Page chrome outside an article; inside one these hold the title or byline.
const CHROME_TAGS: [&str; 2] = ["header", "footer"];

const BLOCK_TAGS: [&str; 15] = [
    "h1", "h2", "h3", "h4", "h5", "h6", "p", "li", "blockquote", "pre", "td", "th", "dt", "dd",
    "figcaption",
];

const INLINE_TAGS: [&str; 18] = [
    "a", "abbr", "b", "bdi", "cite", "code", "em", "i", "kbd", "label", "mark", "q", "s", "small",
    "span", "strong", "sub", "sup",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ContentKind {
    Html,
    PlainText,
}

/// Fetches a single page over HTTP(S) and reduces it to readable text.
#[derive(Debug, Clone)]
pub struct WebPageLoader {
    client: Client,
}

impl WebPageLoader {
    pub fn new(timeout: Duration) -> Result<Self, FetchError> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(FetchError::Http)?;
        Ok(Self { client })
    }
}

#[async_trait]
impl DocumentLoader for WebPageLoader {
    async fn load(&self, url: &str) -> Result<SourceDocument, LoadError> {
        let parsed = Url::parse(url.trim()).map_err(FetchError::from)?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(FetchError::UnsupportedScheme(parsed.scheme().to_string()).into());
        }

        let response = self
            .client
            .get(parsed.clone())
            .send()
            .await
            .map_err(FetchError::from)?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                status: status.as_u16(),
                url: parsed.to_string(),
            }
            .into());
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let kind = classify_content_type(content_type.as_deref())?;

        // Decodes with the charset named by Content-Type, UTF-8 otherwise.
        let decoded = response.text().await.map_err(FetchError::from)?;
        debug!(url = %parsed, bytes = decoded.len(), ?kind, "fetched page");

        if decoded.is_empty() {
            return Err(LoadError::Extraction(format!("empty body at {parsed}")));
        }
        if decoded.contains('\0') {
            return Err(LoadError::Extraction(format!(
                "binary content at {parsed}"
            )));
        }

        let raw_text = match kind {
            ContentKind::Html => extract_readable_text(&decoded),
            ContentKind::PlainText => normalize_plain_text(&decoded),
        };

        if raw_text.trim().is_empty() {
            return Err(LoadError::Extraction(format!(
                "no readable text found at {parsed}"
            )));
        }

        Ok(SourceDocument {
            url: parsed.to_string(),
            raw_text,
            fetched_at: Utc::now(),
        })
    }
}

fn classify_content_type(header: Option<&str>) -> Result<ContentKind, FetchError> {
    let Some(header) = header else {
        return Ok(ContentKind::Html);
    };

    let mime = header
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();

    match mime.as_str() {
        "" | "text/html" | "application/xhtml+xml" => Ok(ContentKind::Html),
        "text/plain" => Ok(ContentKind::PlainText),
        _ => Err(FetchError::UnsupportedContentType(mime)),
    }
}

pub fn normalize_whitespace(text: &str) -> String {
    text.replace('\u{a0}', " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Keeps paragraph breaks (blank lines) and collapses everything else.
pub fn normalize_plain_text(text: &str) -> String {
    let mut paragraphs = Vec::new();
    let mut current = Vec::new();

    for line in text.lines() {
        if line.trim().is_empty() {
            if !current.is_empty() {
                paragraphs.push(normalize_whitespace(&current.join(" ")));
                current.clear();
            }
            continue;
        }
        current.push(line);
    }
    if !current.is_empty() {
        paragraphs.push(normalize_whitespace(&current.join(" ")));
    }

    paragraphs.join("\n\n")
}

/// Reduces an HTML document to its readable blocks separated by blank lines.
pub fn extract_readable_text(html: &str) -> String {
    let document = Html::parse_document(html);
    let (roots, content_scoped) = pick_roots(&document);

    let mut collector = BlockCollector::new(content_scoped);
    for root in roots {
        collector.walk(root);
        collector.flush();
    }
    collector.finish()
}

/// Every outermost `article`, else every outermost `main`, else `body`.
/// The flag is set when the roots are content containers rather than the whole page.
fn pick_roots(document: &Html) -> (Vec<ElementRef<'_>>, bool) {
    for tag in ["article", "main"] {
        let Ok(selector) = Selector::parse(tag) else {
            continue;
        };
        let roots: Vec<_> = document
            .select(&selector)
            .filter(|element| !has_ancestor(*element, tag))
            .collect();
        if !roots.is_empty() {
            return (roots, true);
        }
    }

    let body = Selector::parse("body")
        .ok()
        .and_then(|selector| document.select(&selector).next())
        .unwrap_or_else(|| document.root_element());
    (vec![body], false)
}

fn has_ancestor(element: ElementRef<'_>, tag: &str) -> bool {
    element
        .ancestors()
        .filter_map(ElementRef::wrap)
        .any(|ancestor| ancestor.value().name() == tag)
}

struct BlockCollector {
    blocks: Vec<String>,
    pending: String,
    content_scoped: bool,
}

impl BlockCollector {
    fn new(content_scoped: bool) -> Self {
        Self {
            blocks: Vec::new(),
            pending: String::new(),
            content_scoped,
        }
    }

    fn skips(&self, tag: &str) -> bool {
        SKIPPED_TAGS.contains(&tag) || (!self.content_scoped && CHROME_TAGS.contains(&tag))
    }

    fn walk(&mut self, element: ElementRef<'_>) {
        for child in element.children() {
            match child.value() {
                Node::Text(text) => self.pending.push_str(text),
                Node::Element(child_element) => {
                    let Some(child_ref) = ElementRef::wrap(child) else {
                        continue;
                    };
                    let tag = child_element.name();
                    if self.skips(tag) {
                        continue;
                    }
                    if tag == "br" {
                        self.pending.push(' ');
                    } else if BLOCK_TAGS.contains(&tag) {
                        self.flush();
                        let mut text = String::new();
                        self.subtree_text(child_ref, &mut text);
                        self.push_block(&text);
                    } else if INLINE_TAGS.contains(&tag) {
                        self.walk(child_ref);
                    } else {
                        self.flush();
                        self.walk(child_ref);
                        self.flush();
                    }
                }
                _ => {}
            }
        }
    }

    fn flush(&mut self) {
        let pending = std::mem::take(&mut self.pending);
        self.push_block(&pending);
    }

    fn push_block(&mut self, text: &str) {
        let normalized = normalize_whitespace(text);
        if !normalized.is_empty() {
            self.blocks.push(normalized);
        }
    }

    fn finish(mut self) -> String {
        self.flush();
        self.blocks.join("\n\n")
    }

    fn subtree_text(&self, element: ElementRef<'_>, out: &mut String) {
        for child in element.children() {
            match child.value() {
                Node::Text(text) => out.push_str(text),
                Node::Element(child_element) => {
                    let tag = child_element.name();
                    if self.skips(tag) {
                        continue;
                    }
                    let Some(child_ref) = ElementRef::wrap(child) else {
                        continue;
                    };
                    if INLINE_TAGS.contains(&tag) {
                        self.subtree_text(child_ref, out);
                    } else {
                        out.push(' ');
                        self.subtree_text(child_ref, out);
                        out.push(' ');
                    }
                }
                _ => {}
            }
        }
    }
}
