//! CSS selection over HTML for provider scripts.
//!
//! Scripts see this through a small `cheerio.load(html)` facade; the Rust
//! side only answers "which elements match this selector" and returns plain
//! data, so no DOM handle ever crosses into the sandbox.

use std::collections::BTreeMap;

use scraper::{ElementRef, Html, Selector};
use serde::Serialize;

use super::{CapabilityError, Result};

/// One matched element, flattened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SelectedNode {
    pub tag: String,
    pub text: String,
    /// Inner HTML; nested selection runs against this.
    pub inner: String,
    pub outer: String,
    pub attrs: BTreeMap<String, String>,
}

impl From<ElementRef<'_>> for SelectedNode {
    fn from(el: ElementRef<'_>) -> Self {
        Self {
            tag: el.value().name().to_string(),
            text: el.text().collect(),
            inner: el.inner_html(),
            outer: el.html(),
            attrs: el
                .value()
                .attrs()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }
}

/// Select all elements matching `selector` in document order.
pub fn select(html: &str, selector: &str) -> Result<Vec<SelectedNode>> {
    let selector = Selector::parse(selector)
        .map_err(|e| CapabilityError::Selector(format!("{selector}: {e:?}")))?;
    let document = Html::parse_document(html);
    Ok(document.select(&selector).map(SelectedNode::from).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"
        <html><body>
          <div class="links">
            <a href="/one" data-q="720">First <b>link</b></a>
            <a href="/two">Second</a>
          </div>
          <iframe src="https://player.example/embed/42"></iframe>
        </body></html>
    "#;

    #[test]
    fn selects_in_document_order() {
        let nodes = select(PAGE, ".links a").unwrap();
        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[0].tag, "a");
        assert_eq!(nodes[0].text, "First link");
        assert_eq!(nodes[0].attrs["href"], "/one");
        assert_eq!(nodes[0].attrs["data-q"], "720");
        assert_eq!(nodes[1].attrs["href"], "/two");
    }

    #[test]
    fn inner_html_supports_nested_selection() {
        let div = select(PAGE, "div.links").unwrap().remove(0);
        let bold = select(&div.inner, "b").unwrap();
        assert_eq!(bold.len(), 1);
        assert_eq!(bold[0].text, "link");
    }

    #[test]
    fn no_match_is_empty() {
        assert!(select(PAGE, "video source").unwrap().is_empty());
    }

    #[test]
    fn invalid_selector_is_an_error() {
        for selector in ["a[[", ":::"] {
            let err = select(PAGE, selector).unwrap_err();
            assert!(matches!(err, CapabilityError::Selector(_)), "{selector}: {err}");
        }
    }
}
