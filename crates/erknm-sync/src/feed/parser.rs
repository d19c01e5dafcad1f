//! Parsers for `list.xml` and dataset manifests
//!
//! Both documents are small, but element nesting varies between portal
//! releases, so elements are matched by local name at any depth.

use anyhow::{Context, Result};
use quick_xml::events::{BytesStart, Event};
use quick_xml::reader::Reader;

use super::{DatasetManifest, FeedEntry, VersionEntry};

fn attribute(element: &BytesStart<'_>, name: &str) -> Result<Option<String>> {
    for attr in element.attributes() {
        let attr = attr.context("Malformed attribute")?;
        if attr.key.local_name().as_ref() == name.as_bytes() {
            let value = attr
                .unescape_value()
                .context("Failed to decode attribute value")?;
            return Ok(Some(value.into_owned()));
        }
    }
    Ok(None)
}

/// Every `item` element, wherever it sits in the listing. `format`
/// defaults to `xml`.
pub fn parse_feed_list(bytes: &[u8]) -> Result<Vec<FeedEntry>> {
    let mut reader = Reader::from_reader(bytes);
    reader.config_mut().trim_text(true);

    let mut entries = Vec::new();
    let mut buf = Vec::new();

    loop {
        buf.clear();
        match reader
            .read_event_into(&mut buf)
            .context("Failed to parse feed listing")?
        {
            Event::Start(ref e) | Event::Empty(ref e) if e.local_name().as_ref() == b"item" => {
                entries.push(FeedEntry {
                    identifier: attribute(e, "identifier")?.unwrap_or_default(),
                    title: attribute(e, "title")?.unwrap_or_default(),
                    link: attribute(e, "link")?.unwrap_or_default(),
                    format: attribute(e, "format")?.unwrap_or_else(|| "xml".to_string()),
                });
            },
            Event::Eof => break,
            _ => {},
        }
    }

    Ok(entries)
}

#[derive(Default)]
struct VersionBuilder {
    source: Option<String>,
    created: Option<String>,
    provenance: Option<String>,
    structure: Option<String>,
}

impl VersionBuilder {
    fn slot(&mut self, name: &[u8]) -> Option<&mut Option<String>> {
        match name {
            b"source" => Some(&mut self.source),
            b"created" => Some(&mut self.created),
            b"provenance" => Some(&mut self.provenance),
            b"structure" => Some(&mut self.structure),
            _ => None,
        }
    }

    fn build(self) -> Option<VersionEntry> {
        Some(VersionEntry {
            source: self.source.filter(|s| !s.is_empty())?,
            created: self.created.unwrap_or_default(),
            provenance: self.provenance.unwrap_or_default(),
            structure: self.structure.unwrap_or_default(),
        })
    }
}

/// Dataset manifest: the first `identifier`, `title`, `description`,
/// `creator` and `subject` texts in the document, plus every `dataversion`.
/// Versions without a `source` are dropped.
pub fn parse_manifest(bytes: &[u8]) -> Result<DatasetManifest> {
    let mut reader = Reader::from_reader(bytes);
    reader.config_mut().trim_text(true);

    let mut manifest = DatasetManifest::default();
    let mut seen_meta = [false; 5];
    let mut path: Vec<Vec<u8>> = Vec::new();
    let mut version: Option<VersionBuilder> = None;
    let mut buf = Vec::new();

    loop {
        buf.clear();
        match reader
            .read_event_into(&mut buf)
            .context("Failed to parse dataset manifest")?
        {
            Event::Start(ref e) => {
                let name = e.local_name().as_ref().to_vec();
                if name == b"dataversion" {
                    version = Some(VersionBuilder::default());
                }
                path.push(name);
            },
            Event::End(ref e) => {
                if e.local_name().as_ref() == b"dataversion" {
                    if let Some(entry) = version.take().and_then(VersionBuilder::build) {
                        manifest.versions.push(entry);
                    }
                }
                path.pop();
            },
            Event::Text(ref t) => {
                let Some(current) = path.last() else {
                    continue;
                };
                let text = t.unescape().context("Failed to decode manifest text")?;

                if let Some(builder) = version.as_mut() {
                    if let Some(slot) = builder.slot(current) {
                        if slot.is_none() {
                            *slot = Some(text.into_owned());
                        }
                    }
                    continue;
                }

                let index = match current.as_slice() {
                    b"identifier" => 0,
                    b"title" => 1,
                    b"description" => 2,
                    b"creator" => 3,
                    b"subject" => 4,
                    _ => continue,
                };
                if !seen_meta[index] {
                    seen_meta[index] = true;
                    let field = match index {
                        0 => &mut manifest.identifier,
                        1 => &mut manifest.title,
                        2 => &mut manifest.description,
                        3 => &mut manifest.creator,
                        _ => &mut manifest.subject,
                    };
                    *field = text.into_owned();
                }
            },
            Event::Eof => break,
            _ => {},
        }
    }

    Ok(manifest)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const LIST: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<list>
  <meta><creator>Генпрокуратура</creator></meta>
  <standardversion>
    <item identifier="7710146102-plan-2024" title="Планы проверок 2024" link="https://example.test/7710146102-plan-2024/meta.xml" format="xml"/>
    <item identifier="7710146102-inspection-2024" title="Проверки &amp; результаты" link="https://example.test/7710146102-inspection-2024/meta.xml"></item>
  </standardversion>
</list>"#;

    const MANIFEST: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<meta>
  <identifier>7710146102-plan-2024</identifier>
  <title>Планы проверок 2024</title>
  <description>Сведения о плановых проверках</description>
  <creator><title>Генпрокуратура</title></creator>
  <subject>Надзор</subject>
  <data>
    <dataversion>
      <source>https://example.test/data-20240101.zip</source>
      <created>20240101</created>
      <provenance>initial</provenance>
      <structure>20230101</structure>
    </dataversion>
    <dataversion>
      <created>20240201</created>
    </dataversion>
    <dataversion>
      <source>https://example.test/data-20240301.zip</source>
    </dataversion>
  </data>
</meta>"#;

    #[test]
    fn test_parse_feed_list() {
        let entries = parse_feed_list(LIST.as_bytes()).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].identifier, "7710146102-plan-2024");
        assert_eq!(entries[0].title, "Планы проверок 2024");
        assert_eq!(entries[1].title, "Проверки & результаты");
        assert_eq!(entries[1].format, "xml");
    }

    #[test]
    fn test_parse_feed_list_rejects_garbage() {
        assert!(parse_feed_list(b"<list><item identifier=\"x\"></list>").is_err());
        assert!(parse_feed_list(b"").unwrap().is_empty());
    }

    #[test]
    fn test_parse_manifest() {
        let manifest = parse_manifest(MANIFEST.as_bytes()).unwrap();
        assert_eq!(manifest.identifier, "7710146102-plan-2024");
        assert_eq!(manifest.title, "Планы проверок 2024");
        assert_eq!(manifest.subject, "Надзор");

        assert_eq!(manifest.versions.len(), 2);
        assert_eq!(manifest.versions[0].created, "20240101");
        assert_eq!(manifest.versions[0].structure, "20230101");
        assert_eq!(
            manifest.versions[1].source,
            "https://example.test/data-20240301.zip"
        );
        assert_eq!(manifest.versions[1].provenance, "");
    }
}
