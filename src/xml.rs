//! Blob service XML payloads.
//!
//! Two documents cross the wire as XML: the `<BlockList>` body of Put Block
//! List, written here with the `quick-xml` event writer, and the
//! `<EnumerationResults>` answer to List Blobs, read through `quick-xml`'s
//! serde deserializer.

use chrono::{DateTime, Utc};
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{de, Writer};
use serde::Deserialize;
use std::io::Cursor;

use crate::errors::BackendError;
use crate::storage::backend::BlobItem;

// ── BlockList ───────────────────────────────────────────────────────

/// Render the Put Block List body committing `block_ids` in order.
///
/// ```xml
/// <?xml version="1.0" encoding="utf-8"?>
/// <BlockList>
///   <Latest>MDAwMDA=</Latest>
///   <Latest>MDAwMDE=</Latest>
/// </BlockList>
/// ```
pub fn render_block_list(block_ids: &[String]) -> Result<String, BackendError> {
    render_block_list_inner(block_ids).map_err(|e| BackendError::Malformed {
        operation: "put_block_list",
        message: e.to_string(),
    })
}

fn render_block_list_inner(block_ids: &[String]) -> Result<String, quick_xml::Error> {
    let mut writer = Writer::new(Cursor::new(Vec::new()));

    writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("utf-8"), None)))?;
    writer.write_event(Event::Start(BytesStart::new("BlockList")))?;
    for id in block_ids {
        write_text_element(&mut writer, "Latest", id)?;
    }
    writer.write_event(Event::End(BytesEnd::new("BlockList")))?;

    Ok(String::from_utf8_lossy(&writer.into_inner().into_inner()).into_owned())
}

// ── EnumerationResults ──────────────────────────────────────────────

/// One page of a List Blobs answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListBlobsPage {
    pub items: Vec<BlobItem>,
    /// Continuation marker; `None` on the last page.
    pub next_marker: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct EnumerationResults {
    #[serde(default)]
    blobs: Blobs,
    #[serde(default)]
    next_marker: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct Blobs {
    #[serde(rename = "Blob", default)]
    blob: Vec<BlobEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct BlobEntry {
    name: String,
    #[serde(default)]
    properties: BlobEntryProperties,
}

#[derive(Debug, Default, Deserialize)]
struct BlobEntryProperties {
    #[serde(rename = "Last-Modified", default)]
    last_modified: Option<String>,
    #[serde(rename = "Content-Length", default)]
    content_length: Option<u64>,
}

/// Parse an `<EnumerationResults>` document.
pub fn parse_list_blobs(body: &str) -> Result<ListBlobsPage, BackendError> {
    let results: EnumerationResults =
        de::from_str(body).map_err(|e| BackendError::Malformed {
            operation: "list_blobs",
            message: e.to_string(),
        })?;

    let items = results
        .blobs
        .blob
        .into_iter()
        .map(|entry| BlobItem {
            name: entry.name,
            content_length: entry.properties.content_length.unwrap_or(0),
            last_modified: entry
                .properties
                .last_modified
                .as_deref()
                .and_then(|raw| httpdate::parse_http_date(raw).ok())
                .map(DateTime::<Utc>::from),
        })
        .collect();

    Ok(ListBlobsPage {
        items,
        next_marker: results.next_marker.filter(|m| !m.is_empty()),
    })
}

// ── Helpers ─────────────────────────────────────────────────────────

/// Write a `<tag>text</tag>` element.
fn write_text_element(
    writer: &mut Writer<Cursor<Vec<u8>>>,
    tag: &str,
    text: &str,
) -> Result<(), quick_xml::Error> {
    writer.write_event(Event::Start(BytesStart::new(tag)))?;
    writer.write_event(Event::Text(BytesText::new(text)))?;
    writer.write_event(Event::End(BytesEnd::new(tag)))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_render_block_list() {
        let xml = render_block_list(&["MDAwMDA=".to_string(), "MDAwMDE=".to_string()]).unwrap();
        assert!(xml.starts_with("<?xml version=\"1.0\" encoding=\"utf-8\"?>"));
        assert!(xml.contains(
            "<BlockList><Latest>MDAwMDA=</Latest><Latest>MDAwMDE=</Latest></BlockList>"
        ));
    }

    #[test]
    fn test_render_empty_block_list() {
        let xml = render_block_list(&[]).unwrap();
        assert!(xml.contains("<BlockList></BlockList>"));
    }

    #[test]
    fn test_parse_list_blobs_page() {
        let body = r#"<?xml version="1.0" encoding="utf-8"?>
<EnumerationResults ServiceEndpoint="https://acct.blob.core.windows.net/" ContainerName="media">
  <Prefix>dir/</Prefix>
  <Marker />
  <Blobs>
    <Blob>
      <Name>dir/a.txt</Name>
      <Properties>
        <Last-Modified>Tue, 01 Mar 2022 08:12:34 GMT</Last-Modified>
        <Etag>0x8D9FB6B1C2D3E4F</Etag>
        <Content-Length>12</Content-Length>
        <Content-Type>text/plain</Content-Type>
      </Properties>
    </Blob>
    <Blob>
      <Name>dir/sub/b.bin</Name>
      <Properties>
        <Content-Length>0</Content-Length>
      </Properties>
    </Blob>
  </Blobs>
  <NextMarker>2!84!MDAwMDE=</NextMarker>
</EnumerationResults>"#;

        let page = parse_list_blobs(body).unwrap();
        assert_eq!(page.items.len(), 2);
        assert_eq!(page.items[0].name, "dir/a.txt");
        assert_eq!(page.items[0].content_length, 12);
        assert_eq!(
            page.items[0].last_modified,
            Some(Utc.with_ymd_and_hms(2022, 3, 1, 8, 12, 34).unwrap())
        );
        assert_eq!(page.items[1].name, "dir/sub/b.bin");
        assert_eq!(page.items[1].last_modified, None);
        assert_eq!(page.next_marker.as_deref(), Some("2!84!MDAwMDE="));
    }

    #[test]
    fn test_parse_last_page() {
        let body = r#"<?xml version="1.0" encoding="utf-8"?>
<EnumerationResults ContainerName="media">
  <Blobs />
  <NextMarker />
</EnumerationResults>"#;

        let page = parse_list_blobs(body).unwrap();
        assert!(page.items.is_empty());
        assert_eq!(page.next_marker, None);
    }

    #[test]
    fn test_parse_missing_name_is_malformed() {
        let body = "<EnumerationResults><Blobs><Blob><Properties /></Blob></Blobs></EnumerationResults>";
        let err = parse_list_blobs(body).unwrap_err();
        assert!(matches!(err, BackendError::Malformed { .. }));
    }
}
