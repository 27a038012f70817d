//! OPML subscription import.

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use thiserror::Error;

use super::address::validate_feed_url;
use super::record::Feed;
use crate::storage::{FeedStore, StoreError};

/// Maximum allowed nesting depth for OPML outline elements.
const MAX_OPML_DEPTH: usize = 50;

/// Errors that can occur during OPML import.
#[derive(Debug, Error)]
pub enum OpmlError {
    /// OPML nesting depth exceeds the safety limit.
    #[error("OPML nesting depth exceeds maximum of {0} levels")]
    MaxDepthExceeded(usize),

    /// XML parsing failed.
    #[error("XML parse error: {0}")]
    XmlParse(String),

    /// File I/O error.
    #[error("Failed to read OPML file: {0}")]
    Io(#[from] std::io::Error),

    /// Storing an imported feed failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Counts reported by [`import`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportSummary {
    pub added: usize,
    pub already_present: usize,
}

/// Read an OPML file and add every feed outline to `store`.
pub async fn import(path: &str, store: &dyn FeedStore) -> Result<ImportSummary, OpmlError> {
    let content = tokio::fs::read_to_string(path).await?;
    let urls = parse_feed_urls(&content)?;

    let mut summary = ImportSummary::default();
    for url in urls {
        if store.add_feed(&Feed::new(url.as_str())).await? {
            summary.added += 1;
        } else {
            summary.already_present += 1;
        }
    }

    tracing::info!(
        path = %path,
        added = summary.added,
        already_present = summary.already_present,
        "OPML import finished"
    );
    Ok(summary)
}

/// Extract the `xmlUrl` of every outline, at any nesting depth.
///
/// Outlines with an invalid URL are skipped with a warning. quick-xml does not
/// expand custom entity declarations, so `&xxe;`-style references fail to
/// decode instead of being resolved.
pub fn parse_feed_urls(content: &str) -> Result<Vec<String>, OpmlError> {
    let mut reader = Reader::from_str(content);
    reader.config_mut().trim_text(true);

    let mut urls = Vec::new();
    let mut buf = Vec::new();
    let mut depth: usize = 0;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) if e.name().as_ref() == b"outline" => {
                depth += 1;
                if depth > MAX_OPML_DEPTH {
                    return Err(OpmlError::MaxDepthExceeded(MAX_OPML_DEPTH));
                }
                urls.extend(outline_url(&e, &reader)?);
            }
            Ok(Event::Empty(e)) if e.name().as_ref() == b"outline" => {
                urls.extend(outline_url(&e, &reader)?);
            }
            Ok(Event::End(e)) if e.name().as_ref() == b"outline" => {
                depth = depth.saturating_sub(1);
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(OpmlError::XmlParse(e.to_string())),
            _ => {}
        }
        buf.clear();
    }

    Ok(urls)
}

fn outline_url(e: &BytesStart<'_>, reader: &Reader<&[u8]>) -> Result<Option<String>, OpmlError> {
    for attr in e.attributes() {
        let attr = match attr {
            Ok(attr) => attr,
            Err(err) => {
                tracing::warn!(error = %err, "Skipping malformed OPML attribute");
                continue;
            }
        };
        if attr.key.as_ref() != b"xmlUrl" {
            continue;
        }

        let value = attr
            .decode_and_unescape_value(reader.decoder())
            .map_err(|err| OpmlError::XmlParse(err.to_string()))?;
        return match validate_feed_url(&value) {
            Ok(url) => Ok(Some(url.to_string())),
            Err(err) => {
                tracing::warn!(url = %value, error = %err, "Skipping invalid feed URL");
                Ok(None)
            }
        };
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    const OPML: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<opml version="2.0">
  <head><title>Subscriptions</title></head>
  <body>
    <outline text="Tech">
      <outline text="A" type="rss" xmlUrl="https://a.example/feed.xml"/>
      <outline text="B" type="rss" xmlUrl="https://b.example/rss?x=1&amp;y=2"/>
    </outline>
    <outline text="Local" xmlUrl="file:///etc/passwd"/>
    <outline text="C" xmlUrl="https://c.example/atom"></outline>
  </body>
</opml>"#;

    #[test]
    fn test_parse_nested_outlines() {
        let urls = parse_feed_urls(OPML).unwrap();
        assert_eq!(
            urls,
            vec![
                "https://a.example/feed.xml",
                "https://b.example/rss?x=1&y=2",
                "https://c.example/atom",
            ]
        );
    }

    #[test]
    fn test_depth_limit() {
        let mut content = String::from("<opml><body>");
        for _ in 0..=MAX_OPML_DEPTH {
            content.push_str("<outline text=\"x\">");
        }
        for _ in 0..=MAX_OPML_DEPTH {
            content.push_str("</outline>");
        }
        content.push_str("</body></opml>");

        assert!(matches!(
            parse_feed_urls(&content),
            Err(OpmlError::MaxDepthExceeded(MAX_OPML_DEPTH))
        ));
    }

    #[test]
    fn test_custom_entity_rejected() {
        let content = r#"<?xml version="1.0"?>
<!DOCTYPE opml [<!ENTITY xxe SYSTEM "file:///etc/passwd">]>
<opml><body><outline xmlUrl="&xxe;"/></body></opml>"#;
        assert!(parse_feed_urls(content).is_err());
    }

    #[tokio::test]
    async fn test_import_adds_feeds_once() {
        let path = std::env::temp_dir().join(format!("feedwatch_opml_{}.opml", std::process::id()));
        std::fs::write(&path, OPML).unwrap();
        let store = MemoryStore::new();
        let path_str = path.to_str().unwrap();

        let first = import(path_str, &store).await.unwrap();
        let second = import(path_str, &store).await.unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(first, ImportSummary { added: 3, already_present: 0 });
        assert_eq!(second, ImportSummary { added: 0, already_present: 3 });
        assert_eq!(store.list_feeds().await.unwrap().len(), 3);
    }
}
