//! Event-driven scan of one XML document
//!
//! The document is never materialised. Only the record elements currently
//! open are buffered: their serialized text and the `(name, text)` pairs of
//! their descendants.

use quick_xml::events::Event;
use quick_xml::reader::Reader;
use std::borrow::Cow;
use std::io::BufRead;

use super::ExtractError;
use crate::store::RecordKind;

/// A closed record element
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedElement {
    /// Serialized element, start tag to end tag
    pub raw_xml: String,
    /// Descendant local names with their leading text, in document order
    pub fields: Vec<(String, String)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanEvent {
    /// The document type became known; emitted at most once, before any element
    Kind(RecordKind),
    Element(ParsedElement),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanSummary {
    pub kind: Option<RecordKind>,
    pub elements: u64,
    /// The consumer asked to stop before the end of the document
    pub interrupted: bool,
}

struct Capture {
    depth: usize,
    raw: String,
    fields: Vec<(u64, String, String)>,
}

struct OpenElement {
    name: String,
    seq: u64,
    leading: String,
    leading_done: bool,
}

fn lossy(bytes: &[u8]) -> Cow<'_, str> {
    String::from_utf8_lossy(bytes)
}

fn local_name(qualified: &[u8]) -> String {
    let local = match qualified.iter().rposition(|b| *b == b':') {
        Some(pos) => &qualified[pos + 1..],
        None => qualified,
    };
    lossy(local).into_owned()
}

struct Scanner {
    kind: Option<RecordKind>,
    forced: bool,
    root_seen: bool,
    depth: usize,
    seq: u64,
    open: Vec<OpenElement>,
    captures: Vec<Capture>,
    summary: ScanSummary,
}

impl Scanner {
    fn new(forced: Option<RecordKind>) -> Self {
        Self {
            kind: forced,
            forced: forced.is_some(),
            root_seen: false,
            depth: 0,
            seq: 0,
            open: Vec::new(),
            captures: Vec::new(),
            summary: ScanSummary {
                kind: forced,
                ..Default::default()
            },
        }
    }

    fn append_raw(&mut self, piece: &str) {
        for capture in &mut self.captures {
            capture.raw.push_str(piece);
        }
    }

    /// Detect the type on an opening tag; returns a newly learned kind.
    fn detect(&mut self, name: &str) -> Option<RecordKind> {
        if self.forced || self.kind.is_some() {
            self.root_seen = true;
            return None;
        }
        if !self.root_seen {
            self.root_seen = true;
            if let Some(kind) = RecordKind::from_root_tag(name) {
                self.kind = Some(kind);
                return Some(kind);
            }
        }
        let kind = RecordKind::from_marker(name)?;
        self.kind = Some(kind);
        Some(kind)
    }

    /// Any marker element qualifies once the type is known and is stamped
    /// with that type. A forced type admits only its own marker.
    fn qualifies(&self, name: &str) -> bool {
        match self.kind {
            Some(kind) if self.forced => name.eq_ignore_ascii_case(kind.marker()),
            Some(_) => RecordKind::from_marker(name).is_some(),
            None => false,
        }
    }

    fn open_element(&mut self, name: String) {
        if let Some(parent) = self.open.last_mut() {
            parent.leading_done = true;
        }
        self.depth += 1;
        self.seq += 1;
        self.open.push(OpenElement {
            name,
            seq: self.seq,
            leading: String::new(),
            leading_done: false,
        });
    }

    /// Close the innermost element; returns a finished record, if any.
    fn close_element(&mut self) -> Option<ParsedElement> {
        let element = self.open.pop();
        let depth = self.depth;

        if let Some(element) = element {
            for capture in self.captures.iter_mut().filter(|c| c.depth < depth) {
                capture
                    .fields
                    .push((element.seq, element.name.clone(), element.leading.clone()));
            }
        }

        let finished = match self.captures.last() {
            Some(capture) if capture.depth == depth => self.captures.pop(),
            _ => None,
        };
        self.depth = self.depth.saturating_sub(1);

        finished.map(|capture| {
            let mut fields = capture.fields;
            fields.sort_by_key(|(seq, _, _)| *seq);
            ParsedElement {
                raw_xml: capture.raw,
                fields: fields.into_iter().map(|(_, name, text)| (name, text)).collect(),
            }
        })
    }

    fn push_text(&mut self, text: &str) {
        if self.captures.is_empty() {
            return;
        }
        if let Some(current) = self.open.last_mut() {
            if !current.leading_done {
                current.leading.push_str(text);
            }
        }
    }
}

/// Scan a document, calling `emit` for the detected type and for every
/// record element as it closes. Returning `false` from `emit` stops the
/// scan early.
///
/// Every `plan` or `inspection` element becomes a record of the detected
/// type. With `forced` set, only elements carrying that kind's marker
/// qualify and no detection takes place.
pub fn scan_document<R, F>(
    source: R,
    forced: Option<RecordKind>,
    mut emit: F,
) -> Result<ScanSummary, ExtractError>
where
    R: BufRead,
    F: FnMut(ScanEvent) -> bool,
{
    let mut reader = Reader::from_reader(source);
    let mut scanner = Scanner::new(forced);
    let mut buf = Vec::with_capacity(8 * 1024);

    if let Some(kind) = forced {
        if !emit(ScanEvent::Kind(kind)) {
            scanner.summary.interrupted = true;
            return Ok(scanner.summary);
        }
    }

    loop {
        buf.clear();
        let event = reader
            .read_event_into(&mut buf)
            .map_err(|e| ExtractError::xml(reader.buffer_position(), e))?;

        match event {
            Event::Start(e) => {
                let name = local_name(e.name().as_ref());
                if let Some(kind) = scanner.detect(&name) {
                    scanner.summary.kind = Some(kind);
                    if !emit(ScanEvent::Kind(kind)) {
                        scanner.summary.interrupted = true;
                        break;
                    }
                }

                let piece = format!("<{}>", lossy(&e));
                scanner.append_raw(&piece);
                let qualifies = scanner.qualifies(&name);
                scanner.open_element(name);
                if qualifies {
                    scanner.captures.push(Capture {
                        depth: scanner.depth,
                        raw: piece,
                        fields: Vec::new(),
                    });
                }
            },
            Event::Empty(e) => {
                let name = local_name(e.name().as_ref());
                if let Some(kind) = scanner.detect(&name) {
                    scanner.summary.kind = Some(kind);
                    if !emit(ScanEvent::Kind(kind)) {
                        scanner.summary.interrupted = true;
                        break;
                    }
                }

                let piece = format!("<{}/>", lossy(&e));
                scanner.append_raw(&piece);
                let qualifies = scanner.qualifies(&name);
                scanner.open_element(name);
                if qualifies {
                    scanner.captures.push(Capture {
                        depth: scanner.depth,
                        raw: piece,
                        fields: Vec::new(),
                    });
                }
                if let Some(element) = scanner.close_element() {
                    scanner.summary.elements += 1;
                    if !emit(ScanEvent::Element(element)) {
                        scanner.summary.interrupted = true;
                        break;
                    }
                }
            },
            Event::End(e) => {
                let piece = format!("</{}>", lossy(e.name().as_ref()));
                scanner.append_raw(&piece);
                if let Some(element) = scanner.close_element() {
                    scanner.summary.elements += 1;
                    if !emit(ScanEvent::Element(element)) {
                        scanner.summary.interrupted = true;
                        break;
                    }
                }
            },
            Event::Text(t) => {
                if scanner.captures.is_empty() {
                    continue;
                }
                let escaped = lossy(&t).into_owned();
                scanner.append_raw(&escaped);
                let text = t.unescape().unwrap_or(Cow::Owned(escaped));
                scanner.push_text(&text);
            },
            Event::CData(c) => {
                if scanner.captures.is_empty() {
                    continue;
                }
                let content = lossy(&c).into_owned();
                scanner.append_raw(&format!("<![CDATA[{}]]>", content));
                scanner.push_text(&content);
            },
            Event::Comment(c) => {
                if !scanner.captures.is_empty() {
                    scanner.append_raw(&format!("<!--{}-->", lossy(&c)));
                }
            },
            Event::PI(p) => {
                if !scanner.captures.is_empty() {
                    scanner.append_raw(&format!("<?{}?>", lossy(&p)));
                }
            },
            Event::Eof => break,
            _ => {},
        }
    }

    Ok(scanner.summary)
}
