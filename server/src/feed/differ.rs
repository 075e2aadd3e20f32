//! Minimal Atom/RSS feed differ. Spec §4.D treats the feed parser as an
//! opaque collaborator ("an opaque feed differ"); this is the small,
//! real implementation behind that trait so the pipeline is runnable.
//! The pipeline itself only depends on [`FeedDiffer`].

use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};

use crate::store::entities::FeedContentType;
use crate::utils::crypto::sha1_hex;
use super::error::FeedError;

/// One atom:entry or rss:item, with its id, content hash, and verbatim XML.
#[derive(Debug, Clone)]
pub struct ParsedEntry {
    pub id: String,
    pub content_hash: String,
    pub xml: String,
}

/// A parsed feed document: the envelope split around its entries, and the
/// entries themselves in document order.
#[derive(Debug, Clone)]
pub struct ParsedFeed {
    pub envelope_header: String,
    pub envelope_footer: String,
    pub entries: Vec<ParsedEntry>,
}

/// Strategy interface for parsing a fetched feed document (spec §9's
/// "explicit strategy interface" for the plugin-manager customisation
/// points the original hub wired through hooks).
pub trait FeedDiffer: Send + Sync {
    fn parse(&self, format: FeedContentType, raw: &str) -> Result<ParsedFeed, FeedError>;
}

/// `quick-xml`-backed [`FeedDiffer`] covering Atom and RSS 2.0.
#[derive(Debug, Default, Clone, Copy)]
pub struct QuickXmlDiffer;

impl FeedDiffer for QuickXmlDiffer {
    fn parse(&self, format: FeedContentType, raw: &str) -> Result<ParsedFeed, FeedError> {
        // RSS splices entries before `</channel>`, not `</rss>` — the root
        // element's own close tag sits after the channel's and must stay in
        // the footer untouched (matches the original's `close_tag`).
        let (entry_tag, id_candidates, root_tag, close_tag): (&str, &[&str], &str, &str) =
            match format {
                FeedContentType::Atom => ("entry", &["id"], "feed", "</feed>"),
                FeedContentType::Rss => ("item", &["guid", "link"], "rss", "</channel>"),
            };

        if !raw.contains(&format!("<{}", root_tag)) {
            return Err(FeedError::ParseFailed(format!(
                "root element <{}> not found",
                root_tag
            )));
        }

        let footer_start = raw
            .rfind(close_tag)
            .ok_or_else(|| FeedError::ParseFailed(format!("closing tag {} not found", close_tag)))?;
        let envelope_footer = raw[footer_start..].to_string();

        let mut reader = Reader::from_str(raw);
        reader.config_mut().trim_text(false);
        let mut buf = Vec::new();
        let mut entries = Vec::new();
        let mut first_entry_start: Option<usize> = None;
        let mut entry_start: Option<usize> = None;
        let mut depth: u32 = 0;

        loop {
            let pos_before = reader.buffer_position() as usize;
            let event = reader
                .read_event_into(&mut buf)
                .map_err(|e| FeedError::ParseFailed(e.to_string()))?;
            match event {
                Event::Eof => break,
                Event::Start(e) if local_name(&e) == entry_tag => {
                    if depth == 0 {
                        entry_start = Some(pos_before);
                        first_entry_start.get_or_insert(pos_before);
                    }
                    depth += 1;
                }
                Event::End(e) if local_name(&e) == entry_tag => {
                    depth = depth.saturating_sub(1);
                    if depth == 0
                        && let Some(start) = entry_start.take()
                    {
                        let end = reader.buffer_position() as usize;
                        entries.push(build_entry(&raw[start..end], id_candidates));
                    }
                }
                Event::Empty(e) if local_name(&e) == entry_tag && depth == 0 => {
                    let end = reader.buffer_position() as usize;
                    first_entry_start.get_or_insert(pos_before);
                    entries.push(build_entry(&raw[pos_before..end], id_candidates));
                }
                _ => {}
            }
            buf.clear();
        }

        let header_end = first_entry_start.unwrap_or(footer_start);
        let envelope_header = strip_xml_prolog(&raw[..header_end]);

        Ok(ParsedFeed {
            envelope_header,
            envelope_footer,
            entries,
        })
    }
}

/// Drops a leading `<?xml …?>` declaration, if present, so the caller can
/// prepend its own prolog without stacking two of them (spec §4.D step 8;
/// the original prepends a fresh declaration to a header that excludes it).
fn strip_xml_prolog(s: &str) -> String {
    let trimmed = s.trim_start();
    match trimmed.strip_prefix("<?xml") {
        Some(rest) => match rest.find("?>") {
            Some(end) => rest[end + 2..].to_string(),
            None => s.to_string(),
        },
        None => s.to_string(),
    }
}

fn build_entry(xml: &str, id_candidates: &[&str]) -> ParsedEntry {
    let content_hash = sha1_hex(xml);
    let id = extract_id(xml, id_candidates).unwrap_or_else(|| content_hash.clone());
    ParsedEntry {
        id,
        content_hash,
        xml: xml.to_string(),
    }
}

fn local_name(e: &BytesStart) -> String {
    String::from_utf8_lossy(e.local_name().as_ref()).into_owned()
}

/// First non-empty text of the first matching candidate tag, tried in
/// priority order (e.g. RSS prefers `guid` over `link`).
fn extract_id(xml: &str, candidates: &[&str]) -> Option<String> {
    candidates.iter().find_map(|tag| find_first_tag_text(xml, tag))
}

fn find_first_tag_text(xml: &str, tag: &str) -> Option<String> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    let mut inside = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Eof) | Err(_) => return None,
            Ok(Event::Start(e)) if local_name(&e) == tag => inside = true,
            Ok(Event::Text(t)) if inside => {
                let text = t.unescape().ok()?.trim().to_string();
                if !text.is_empty() {
                    return Some(text);
                }
            }
            Ok(Event::End(e)) if local_name(&e) == tag && inside => return None,
            _ => {}
        }
        buf.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ATOM_FEED: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<feed xmlns="http://www.w3.org/2005/Atom">
  <title>Example</title>
  <entry><id>e1</id><title>First</title></entry>
  <entry><id>e2</id><title>Second</title></entry>
</feed>"#;

    const RSS_FEED: &str = r#"<?xml version="1.0"?>
<rss version="2.0"><channel>
  <title>Example</title>
  <item><guid>g1</guid><title>First</title></item>
  <item><guid>g2</guid><title>Second</title></item>
</channel></rss>"#;

    #[test]
    fn atom_entries_and_ids_are_extracted() {
        let parsed = QuickXmlDiffer.parse(FeedContentType::Atom, ATOM_FEED).unwrap();
        assert_eq!(parsed.entries.len(), 2);
        assert_eq!(parsed.entries[0].id, "e1");
        assert_eq!(parsed.entries[1].id, "e2");
        assert!(parsed.envelope_footer.ends_with("</feed>"));
        assert!(parsed.envelope_header.contains("<title>Example</title>"));
    }

    #[test]
    fn rss_entries_use_guid() {
        let parsed = QuickXmlDiffer.parse(FeedContentType::Rss, RSS_FEED).unwrap();
        assert_eq!(parsed.entries.len(), 2);
        assert_eq!(parsed.entries[0].id, "g1");
        assert!(parsed.envelope_footer.ends_with("</rss>"));
    }

    #[test]
    fn rss_footer_splits_before_channel_close_not_rss_close() {
        let parsed = QuickXmlDiffer.parse(FeedContentType::Rss, RSS_FEED).unwrap();
        assert!(parsed.envelope_footer.starts_with("</channel>"));
        assert!(parsed.envelope_footer.ends_with("</rss>"));
        assert!(!parsed.envelope_header.contains("</channel>"));
    }

    #[test]
    fn envelope_header_strips_the_xml_prolog() {
        let atom = QuickXmlDiffer.parse(FeedContentType::Atom, ATOM_FEED).unwrap();
        assert!(!atom.envelope_header.contains("<?xml"));

        let rss = QuickXmlDiffer.parse(FeedContentType::Rss, RSS_FEED).unwrap();
        assert!(!rss.envelope_header.contains("<?xml"));
    }

    #[test]
    fn wrong_format_is_rejected_for_fallback() {
        assert!(QuickXmlDiffer.parse(FeedContentType::Rss, ATOM_FEED).is_err());
        assert!(QuickXmlDiffer.parse(FeedContentType::Atom, RSS_FEED).is_err());
    }

    #[test]
    fn distinct_entry_content_yields_distinct_hashes() {
        let parsed = QuickXmlDiffer.parse(FeedContentType::Atom, ATOM_FEED).unwrap();
        assert_ne!(parsed.entries[0].content_hash, parsed.entries[1].content_hash);
    }

    #[test]
    fn feed_with_no_entries_still_parses() {
        let empty = "<?xml version=\"1.0\"?><feed><title>Empty</title></feed>";
        let parsed = QuickXmlDiffer.parse(FeedContentType::Atom, empty).unwrap();
        assert!(parsed.entries.is_empty());
        assert!(parsed.envelope_footer.ends_with("</feed>"));
    }
}
