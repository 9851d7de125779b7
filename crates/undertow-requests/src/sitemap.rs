//! Lazy sitemap parsing.
//!
//! Handles both `urlset` documents and `sitemapindex` documents (whose
//! entries are further sitemaps), plus the plain-text variant with one URL
//! per line. The iterator pulls XML events on demand, so a consumer
//! reading through a bounded buffer never forces the whole document's
//! entries to materialize at once.

use std::str::Lines;
use undertow_types::{CoreError, CoreResult};
use xml::reader::{EventReader, XmlEvent};

/// One entry discovered in a sitemap
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SitemapItem {
    /// A crawlable page URL
    Url(String),
    /// The location of a nested sitemap to be parsed in turn
    NestedSitemap(String),
}

/// Iterate the items of a sitemap document, sniffing XML vs. plain text.
pub fn sitemap_items(content: &str) -> SitemapItems<'_> {
    let trimmed = content.trim_start();
    if trimmed.starts_with('<') {
        SitemapItems::Xml(XmlItems {
            parser: EventReader::from_str(content),
            stack: Vec::new(),
            loc_text: String::new(),
            done: false,
        })
    } else {
        SitemapItems::Text(content.lines())
    }
}

/// Iterator returned by [`sitemap_items`]
pub enum SitemapItems<'a> {
    Xml(XmlItems<'a>),
    Text(Lines<'a>),
}

pub struct XmlItems<'a> {
    parser: EventReader<&'a [u8]>,
    stack: Vec<String>,
    loc_text: String,
    done: bool,
}

impl Iterator for SitemapItems<'_> {
    type Item = CoreResult<SitemapItem>;

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            Self::Xml(xml) => xml.next_item(),
            Self::Text(lines) => {
                for line in lines.by_ref() {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    return Some(Ok(SitemapItem::Url(line.to_string())));
                }
                None
            }
        }
    }
}

impl XmlItems<'_> {
    fn next_item(&mut self) -> Option<CoreResult<SitemapItem>> {
        if self.done {
            return None;
        }
        loop {
            let event = match self.parser.next() {
                Ok(event) => event,
                Err(e) => {
                    self.done = true;
                    return Some(Err(CoreError::sources(format!("malformed sitemap: {e}"))));
                }
            };
            match event {
                XmlEvent::StartElement { name, .. } => {
                    if name.local_name == "loc" {
                        self.loc_text.clear();
                    }
                    self.stack.push(name.local_name);
                }
                XmlEvent::Characters(text) | XmlEvent::CData(text) => {
                    if self.stack.last().map(String::as_str) == Some("loc") {
                        self.loc_text.push_str(&text);
                    }
                }
                XmlEvent::EndElement { name } => {
                    self.stack.pop();
                    if name.local_name != "loc" {
                        continue;
                    }
                    let location = self.loc_text.trim().to_string();
                    if location.is_empty() {
                        continue;
                    }
                    // The element enclosing <loc> decides what it points at:
                    // <url> in a urlset, <sitemap> in a sitemapindex.
                    match self.stack.last().map(String::as_str) {
                        Some("sitemap") => {
                            return Some(Ok(SitemapItem::NestedSitemap(location)))
                        }
                        _ => return Some(Ok(SitemapItem::Url(location))),
                    }
                }
                XmlEvent::EndDocument => {
                    self.done = true;
                    return None;
                }
                _ => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(content: &str) -> Vec<SitemapItem> {
        sitemap_items(content).map(|i| i.unwrap()).collect()
    }

    #[test]
    fn parses_urlset() {
        let content = r#"<?xml version="1.0" encoding="UTF-8"?>
            <urlset xmlns="http://www.sitemaps.org/schemas/sitemap/0.9">
                <url><loc>http://example.com/a</loc><lastmod>2024-01-01</lastmod></url>
                <url><loc> http://example.com/b </loc></url>
            </urlset>"#;
        assert_eq!(
            collect(content),
            vec![
                SitemapItem::Url("http://example.com/a".into()),
                SitemapItem::Url("http://example.com/b".into()),
            ]
        );
    }

    #[test]
    fn parses_sitemap_index() {
        let content = r#"<?xml version="1.0"?>
            <sitemapindex xmlns="http://www.sitemaps.org/schemas/sitemap/0.9">
                <sitemap><loc>http://example.com/sitemap-1.xml</loc></sitemap>
                <sitemap><loc>http://example.com/sitemap-2.xml</loc></sitemap>
            </sitemapindex>"#;
        assert_eq!(
            collect(content),
            vec![
                SitemapItem::NestedSitemap("http://example.com/sitemap-1.xml".into()),
                SitemapItem::NestedSitemap("http://example.com/sitemap-2.xml".into()),
            ]
        );
    }

    #[test]
    fn parses_plain_text_lists() {
        let content = "http://example.com/a\n\n  http://example.com/b  \n";
        assert_eq!(
            collect(content),
            vec![
                SitemapItem::Url("http://example.com/a".into()),
                SitemapItem::Url("http://example.com/b".into()),
            ]
        );
    }

    #[test]
    fn malformed_xml_surfaces_an_error() {
        let mut items = sitemap_items("<urlset><url><loc>http://example.com/a</loc>");
        assert!(matches!(
            items.next(),
            Some(Ok(SitemapItem::Url(_)))
        ));
        assert!(matches!(items.next(), Some(Err(_))));
        assert!(items.next().is_none());
    }
}
