//! HTML → readable text and link model.
//!
//! Pages are rendered to Markdown-flavoured text with `htmd` (after stripping
//! page chrome), so the extractor model sees headings, lists and link text
//! rather than raw markup.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use url::Url;

use rowforge_shared::{Result, RowForgeError};

/// A hyperlink discovered on a page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageLink {
    /// Absolute URL, fragment stripped.
    pub href: String,
    /// Anchor text, whitespace collapsed.
    pub text: String,
}

/// Rendered view of one HTML document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderedPage {
    pub title: Option<String>,
    pub text: String,
    pub links: Vec<PageLink>,
}

/// Render a document fetched from `base_url`.
pub fn render(html: &str, base_url: &Url) -> Result<RenderedPage> {
    let doc = Html::parse_document(html);
    let title = extract_title(&doc);
    let links = extract_links(&doc, base_url);

    let content_html = extract_content_html(&doc).unwrap_or_else(|| html.to_string());
    let converter = htmd::HtmlToMarkdown::builder()
        .skip_tags(vec!["script", "style", "nav", "iframe", "noscript", "svg"])
        .build();
    let raw = converter
        .convert(&content_html)
        .map_err(|e| RowForgeError::parse(format!("htmd conversion failed: {e}")))?;

    Ok(RenderedPage {
        title,
        text: cleanup(&raw),
        links,
    })
}

// ---------------------------------------------------------------------------
// Extraction helpers
// ---------------------------------------------------------------------------

/// Inner HTML of the main content container, if one can be identified.
fn extract_content_html(doc: &Html) -> Option<String> {
    // Try known content containers in priority order
    let selectors = ["[role=\"main\"]", "main", "article", ".content", "body"];

    for sel_str in &selectors {
        if let Ok(selector) = Selector::parse(sel_str) {
            if let Some(el) = doc.select(&selector).next() {
                return Some(el.inner_html());
            }
        }
    }
    None
}

/// `<title>`, falling back to the first `<h1>`.
fn extract_title(doc: &Html) -> Option<String> {
    for sel_str in ["title", "h1"] {
        let Ok(selector) = Selector::parse(sel_str) else {
            continue;
        };
        if let Some(el) = doc.select(&selector).next() {
            let text = collapse_whitespace(&el.text().collect::<String>());
            if !text.is_empty() {
                return Some(text);
            }
        }
    }
    None
}

/// Extract all http(s) links from a document, resolved against the base URL.
///
/// Duplicate targets keep the anchor text of their first occurrence.
pub fn extract_links(doc: &Html, base_url: &Url) -> Vec<PageLink> {
    let Ok(link_sel) = Selector::parse("a[href]") else {
        return Vec::new();
    };
    let mut seen = HashSet::new();
    let mut links = Vec::new();

    for el in doc.select(&link_sel) {
        let Some(href) = el.value().attr("href") else {
            continue;
        };
        // Skip anchors, javascript:, mailto:
        if href.starts_with('#') || href.starts_with("javascript:") || href.starts_with("mailto:")
        {
            continue;
        }

        let Ok(mut resolved) = base_url.join(href) else {
            continue;
        };
        if resolved.scheme() != "http" && resolved.scheme() != "https" {
            continue;
        }
        resolved.set_fragment(None);
        let href = resolved.to_string();
        if seen.insert(href.clone()) {
            links.push(PageLink {
                href,
                text: collapse_whitespace(&el.text().collect::<String>()),
            });
        }
    }

    links
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

// ---------------------------------------------------------------------------
// Cleanup
// ---------------------------------------------------------------------------

/// Trim trailing whitespace and collapse runs of blank lines.
fn cleanup(md: &str) -> String {
    static MULTI_BLANK_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"\n{3,}").expect("valid regex"));

    let trimmed = md
        .lines()
        .map(str::trim_end)
        .collect::<Vec<_>>()
        .join("\n");
    MULTI_BLANK_RE
        .replace_all(trimmed.trim(), "\n\n")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Url {
        Url::parse("https://docs.example.com/page1").unwrap()
    }

    #[test]
    fn extract_links_resolves_and_filters() {
        let html = r##"<html><body><a href="/page2">Page 2</a><a href="https://external.com">External</a><a href="#section">Anchor</a><a href="relative/path#frag">Relative</a><a href="mailto:a@b.c">Mail</a></body></html>"##;

        let doc = Html::parse_document(html);
        let links = extract_links(&doc, &base());
        let hrefs: Vec<&str> = links.iter().map(|l| l.href.as_str()).collect();

        assert_eq!(
            hrefs,
            vec![
                "https://docs.example.com/page2",
                "https://external.com/",
                "https://docs.example.com/relative/path",
            ]
        );
        assert_eq!(links[0].text, "Page 2");
    }

    #[test]
    fn duplicate_links_keep_first_anchor_text() {
        let html = r#"<a href="/a">First
            label</a><a href="/a">Second</a>"#;
        let doc = Html::parse_document(html);
        let links = extract_links(&doc, &base());
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].text, "First label");
    }

    #[test]
    fn render_strips_chrome_and_keeps_content() {
        let html = r#"<html><head><title>Acme Team</title></head><body>
            <nav><a href="/">Home</a></nav>
            <main><h1>Our team</h1><p>Jane Doe, CEO.</p><a href="/contact">Contact</a></main>
            <script>var x = 1;</script>
        </body></html>"#;
        let page = render(html, &base()).unwrap();

        assert_eq!(page.title.as_deref(), Some("Acme Team"));
        assert!(page.text.contains("Our team"));
        assert!(page.text.contains("Jane Doe, CEO."));
        assert!(!page.text.contains("var x"));
        // Links come from the whole document, nav included
        assert_eq!(page.links.len(), 2);
    }

    #[test]
    fn title_falls_back_to_h1() {
        let html = "<html><body><h1> Pricing </h1></body></html>";
        let page = render(html, &base()).unwrap();
        assert_eq!(page.title.as_deref(), Some("Pricing"));
    }

    #[test]
    fn cleanup_collapses_blank_lines() {
        assert_eq!(cleanup("a  \n\n\n\nb\n"), "a\n\nb");
    }
}
