//! `[[Field]]` placeholder substitution for Word documents and file names.
//!
//! A `.docx` file is a zip archive of XML parts. Rendering rewrites the parts that carry
//! body text (document, headers, footers, footnotes, endnotes) and copies every other part
//! byte for byte.
//!
//! ## Placeholders
//!
//! Word splits text into runs whenever formatting, spell checking or revision tracking
//! changes, so a placeholder typed as `[[kfname]]` may be stored as `[[kf` + `name]]` in two
//! different runs. Substitution therefore works per paragraph on the joined text of all
//! `<w:t>` nodes and maps every match back to the nodes it came from. The replacement is
//! written into the node where the placeholder started; the other nodes lose the matched
//! characters and keep the rest of their text and formatting.
//!
//! A placeholder without a value is never an error. It is written back literally as a
//! separate red run so the operator can spot it in the finished document.

use crate::constants::UNRESOLVED_PLACEHOLDER_COLOR;
use crate::record::Record;
use crate::{CareError, CareResult};
use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use regex::Regex;
use std::collections::BTreeMap;
use std::io::{Cursor, Read, Write};
use std::sync::OnceLock;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

const OPEN: &str = "[[";
const CLOSE: &str = "]]";

// ============================================================================
// DATA CONTEXT
// ============================================================================

/// Field values available to a template, keyed by field name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DataContext {
    values: BTreeMap<String, String>,
}

impl DataContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every field of `record`, stringified.
    pub fn from_record(record: &Record) -> Self {
        let mut ctx = Self::new();
        ctx.extend_from_record(record);
        ctx
    }

    /// Context for a client and/or caretaker document.
    ///
    /// Caretaker fields override client fields of the same name, except for client fields
    /// starting with `a`: those describe the client's relatives and always keep the client's
    /// value.
    pub fn merge(client: Option<&Record>, caretaker: Option<&Record>) -> Self {
        let mut ctx = Self::new();
        if let Some(client) = client {
            ctx.extend_from_record(client);
        }
        if let Some(caretaker) = caretaker {
            ctx.extend_from_record(caretaker);
        }
        if let Some(client) = client {
            for (name, value) in client.iter().filter(|(name, _)| name.starts_with('a')) {
                ctx.insert(name, value.to_string());
            }
        }
        ctx
    }

    pub fn extend_from_record(&mut self, record: &Record) {
        for (name, value) in record.iter() {
            self.insert(name, value.to_string());
        }
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

// ============================================================================
// FILE NAMES
// ============================================================================

fn filename_placeholder_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"\[\[(.*?)\]\]").ok())
        .as_ref()
}

/// Substitutes placeholders in a template file name.
///
/// Placeholders without a value stay in the name literally and are returned as the second
/// element so the caller can warn about them. Path separators inside values are replaced
/// by `-` so a value cannot move the file to another directory.
pub fn resolve_filename(name: &str, ctx: &DataContext) -> (String, Vec<String>) {
    let Some(pattern) = filename_placeholder_pattern() else {
        return (name.to_owned(), Vec::new());
    };
    let mut missing = Vec::new();
    let resolved = pattern.replace_all(name, |caps: &regex::Captures<'_>| {
        let key = &caps[1];
        match ctx.get(key) {
            Some(value) => value.replace(['/', '\\'], "-"),
            None => {
                missing.push(key.to_owned());
                caps[0].to_owned()
            }
        }
    });
    (resolved.into_owned(), missing)
}

// ============================================================================
// DOCUMENT RENDERING
// ============================================================================

/// A rendered document and the placeholders that had no value.
#[derive(Debug, Clone)]
pub struct RenderOutput {
    pub bytes: Vec<u8>,
    pub missing: Vec<String>,
}

/// Whether a zip entry holds body text that may contain placeholders.
fn is_text_part(name: &str) -> bool {
    let Some(file) = name.strip_prefix("word/") else {
        return false;
    };
    if file.contains('/') || !file.ends_with(".xml") {
        return false;
    }
    file == "document.xml"
        || file == "footnotes.xml"
        || file == "endnotes.xml"
        || file.starts_with("header")
        || file.starts_with("footer")
}

/// Renders a `.docx` template.
///
/// # Arguments
///
/// * `template` - Bytes of the `.docx` file
/// * `ctx` - Values for the placeholders
///
/// # Returns
///
/// The rendered document plus the names of unresolved placeholders, each listed once.
///
/// # Errors
///
/// Returns `CareError::Zip` if the input is not a valid zip archive, or `CareError::Xml`
/// if a text part is not well-formed.
pub fn render(template: &[u8], ctx: &DataContext) -> CareResult<RenderOutput> {
    let mut archive = ZipArchive::new(Cursor::new(template))?;
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    let mut missing = Vec::new();

    for index in 0..archive.len() {
        let mut file = archive.by_index(index)?;
        let name = file.name().to_owned();

        if is_text_part(&name) {
            let mut xml = String::new();
            file.read_to_string(&mut xml).map_err(CareError::FileRead)?;
            let rendered = render_part(&name, &xml, ctx, &mut missing)?;
            writer.start_file(name, options)?;
            writer
                .write_all(rendered.as_bytes())
                .map_err(CareError::FileWrite)?;
        } else {
            writer.raw_copy_file(file)?;
        }
    }

    let bytes = writer.finish()?.into_inner();
    Ok(RenderOutput { bytes, missing })
}

/// Run start tag and its properties, kept to reopen the run after a red insertion.
struct RunInfo {
    start: BytesStart<'static>,
    props: Vec<Event<'static>>,
}

enum Node {
    Raw(Event<'static>),
    Text {
        start: BytesStart<'static>,
        text: String,
        run: Option<usize>,
    },
}

/// Events of one `<w:p>` element, with `<w:t>` contents unescaped.
#[derive(Default)]
struct ParagraphBuffer {
    nodes: Vec<Node>,
    runs: Vec<RunInfo>,
    current_run: Option<usize>,
    props_depth: usize,
    open_text: Option<(BytesStart<'static>, String)>,
}

fn is(name: &[u8], expected: &str) -> bool {
    name == expected.as_bytes()
}

impl ParagraphBuffer {
    fn push(&mut self, event: Event<'static>) -> Result<(), quick_xml::Error> {
        if let Some((_, text)) = self.open_text.as_mut() {
            match &event {
                Event::Text(t) => {
                    text.push_str(&t.unescape()?);
                    return Ok(());
                }
                Event::CData(c) => {
                    text.push_str(&String::from_utf8_lossy(c));
                    return Ok(());
                }
                Event::End(e) if is(e.name().as_ref(), "w:t") => {
                    if let Some((start, text)) = self.open_text.take() {
                        self.nodes.push(Node::Text {
                            start,
                            text,
                            run: self.current_run,
                        });
                    }
                    return Ok(());
                }
                _ => {}
            }
        }

        match &event {
            Event::Start(e) if is(e.name().as_ref(), "w:t") => {
                self.open_text = Some((e.clone(), String::new()));
                return Ok(());
            }
            Event::Start(e) if is(e.name().as_ref(), "w:r") => {
                self.runs.push(RunInfo {
                    start: e.clone(),
                    props: Vec::new(),
                });
                self.current_run = Some(self.runs.len() - 1);
            }
            Event::End(e) if is(e.name().as_ref(), "w:r") => {
                self.current_run = None;
            }
            _ => {}
        }

        if let Some(run) = self.current_run.and_then(|idx| self.runs.get_mut(idx)) {
            match &event {
                Event::Start(e) if is(e.name().as_ref(), "w:rPr") => {
                    self.props_depth += 1;
                    run.props.push(event.clone());
                }
                Event::End(e) if is(e.name().as_ref(), "w:rPr") && self.props_depth > 0 => {
                    self.props_depth -= 1;
                    run.props.push(event.clone());
                }
                _ if self.props_depth > 0 => run.props.push(event.clone()),
                Event::Empty(e) if is(e.name().as_ref(), "w:rPr") => {
                    run.props.push(event.clone());
                }
                _ => {}
            }
        }

        self.nodes.push(Node::Raw(event));
        Ok(())
    }
}

struct Placeholder {
    start: usize,
    end: usize,
    name: String,
}

/// Non-greedy `[[name]]` matches in `text`.
fn find_placeholders(text: &str) -> Vec<Placeholder> {
    let mut found = Vec::new();
    let mut pos = 0;
    while let Some(rel) = text[pos..].find(OPEN) {
        let open = pos + rel;
        let inner_start = open + OPEN.len();
        let Some(close_rel) = text[inner_start..].find(CLOSE) else {
            break;
        };
        let inner = &text[inner_start..inner_start + close_rel];
        // `[[a [[b]]`: only the innermost opener belongs to the closer.
        if let Some(nested) = inner.rfind(OPEN) {
            pos = inner_start + nested;
            continue;
        }
        let end = inner_start + close_rel + CLOSE.len();
        found.push(Placeholder {
            start: open,
            end,
            name: inner.to_owned(),
        });
        pos = end;
    }
    found
}

enum Piece {
    Text(String),
    Break,
    Unresolved(String),
}

fn replacement_pieces(
    placeholder: &Placeholder,
    ctx: &DataContext,
    missing: &mut Vec<String>,
) -> Vec<Piece> {
    match ctx.get(&placeholder.name) {
        Some(value) => {
            let mut pieces = Vec::new();
            for (idx, line) in value.split('\n').enumerate() {
                if idx > 0 {
                    pieces.push(Piece::Break);
                }
                pieces.push(Piece::Text(line.trim_end_matches('\r').to_owned()));
            }
            pieces
        }
        None => {
            if !missing.contains(&placeholder.name) {
                missing.push(placeholder.name.clone());
            }
            vec![Piece::Unresolved(placeholder.name.clone())]
        }
    }
}

fn preserved_text_start() -> BytesStart<'static> {
    BytesStart::new("w:t").with_attributes([("xml:space", "preserve")])
}

fn push_text(out: &mut Vec<Event<'static>>, start: BytesStart<'static>, text: &str) {
    out.push(Event::Start(start));
    out.push(Event::Text(BytesText::new(text).into_owned()));
    out.push(Event::End(BytesEnd::new("w:t")));
}

fn push_red_run(out: &mut Vec<Event<'static>>, name: &str) {
    let color = BytesStart::new("w:color").with_attributes([("w:val", UNRESOLVED_PLACEHOLDER_COLOR)]);
    out.push(Event::Start(BytesStart::new("w:r")));
    out.push(Event::Start(BytesStart::new("w:rPr")));
    out.push(Event::Empty(color));
    out.push(Event::End(BytesEnd::new("w:rPr")));
    push_text(out, preserved_text_start(), &format!("{OPEN}{name}{CLOSE}"));
    out.push(Event::End(BytesEnd::new("w:r")));
}

fn push_pieces(out: &mut Vec<Event<'static>>, pieces: Vec<Piece>, run: Option<&RunInfo>) {
    let mut open = false;
    let close = |out: &mut Vec<Event<'static>>, open: &mut bool| {
        if *open {
            out.push(Event::End(BytesEnd::new("w:t")));
            *open = false;
        }
    };

    for piece in pieces {
        match piece {
            Piece::Text(text) if text.is_empty() => {}
            Piece::Text(text) => {
                if !open {
                    out.push(Event::Start(preserved_text_start()));
                    open = true;
                }
                out.push(Event::Text(BytesText::new(&text).into_owned()));
            }
            Piece::Break => {
                close(out, &mut open);
                out.push(Event::Empty(BytesStart::new("w:br")));
            }
            Piece::Unresolved(name) => {
                close(out, &mut open);
                match run {
                    Some(run) => {
                        out.push(Event::End(BytesEnd::new("w:r")));
                        push_red_run(out, &name);
                        out.push(Event::Start(run.start.clone()));
                        out.extend(run.props.iter().cloned());
                    }
                    None => push_red_run(out, &name),
                }
            }
        }
    }
    close(out, &mut open);
}

fn render_paragraph(
    buffer: ParagraphBuffer,
    ctx: &DataContext,
    missing: &mut Vec<String>,
) -> Vec<Event<'static>> {
    let joined: String = buffer
        .nodes
        .iter()
        .filter_map(|node| match node {
            Node::Text { text, .. } => Some(text.as_str()),
            Node::Raw(_) => None,
        })
        .collect();
    let placeholders = if joined.contains(OPEN) {
        find_placeholders(&joined)
    } else {
        Vec::new()
    };

    let mut out = Vec::with_capacity(buffer.nodes.len());
    let mut offset = 0;

    for node in buffer.nodes {
        let (start, text, run) = match node {
            Node::Raw(event) => {
                out.push(event);
                continue;
            }
            Node::Text { start, text, run } => (start, text, run),
        };

        let node_start = offset;
        let node_end = offset + text.len();
        offset = node_end;

        let touching: Vec<&Placeholder> = placeholders
            .iter()
            .filter(|p| p.start < node_end && p.end > node_start)
            .collect();
        if touching.is_empty() {
            push_text(&mut out, start, &text);
            continue;
        }

        let mut pieces = Vec::new();
        let mut pos = node_start;
        for placeholder in touching {
            if placeholder.start > pos {
                pieces.push(Piece::Text(joined[pos..placeholder.start].to_owned()));
            }
            if placeholder.start >= node_start {
                pieces.extend(replacement_pieces(placeholder, ctx, missing));
            }
            pos = pos.max(placeholder.end.min(node_end));
        }
        if pos < node_end {
            pieces.push(Piece::Text(joined[pos..node_end].to_owned()));
        }

        let run = run.and_then(|idx| buffer.runs.get(idx));
        push_pieces(&mut out, pieces, run);
    }

    out
}

/// Rewrites one XML part, paragraph by paragraph.
fn render_part(
    part: &str,
    xml: &str,
    ctx: &DataContext,
    missing: &mut Vec<String>,
) -> CareResult<String> {
    let xml_err = |message: String| CareError::Xml {
        part: part.to_owned(),
        message,
    };

    let mut reader = Reader::from_str(xml);
    let mut writer = Writer::new(Vec::new());
    // Text boxes nest paragraphs inside runs of an outer paragraph.
    let mut stack: Vec<ParagraphBuffer> = Vec::new();

    loop {
        let event = reader
            .read_event()
            .map_err(|e| xml_err(e.to_string()))?
            .into_owned();

        match event {
            Event::Eof => break,
            Event::Start(ref e) if is(e.name().as_ref(), "w:p") => {
                let mut buffer = ParagraphBuffer::default();
                buffer.nodes.push(Node::Raw(event));
                stack.push(buffer);
            }
            Event::End(ref e) if is(e.name().as_ref(), "w:p") && !stack.is_empty() => {
                let Some(mut buffer) = stack.pop() else {
                    continue;
                };
                buffer.nodes.push(Node::Raw(event));
                let events = render_paragraph(buffer, ctx, missing);
                match stack.last_mut() {
                    Some(parent) => parent.nodes.extend(events.into_iter().map(Node::Raw)),
                    None => {
                        for event in events {
                            writer
                                .write_event(event)
                                .map_err(|e| xml_err(e.to_string()))?;
                        }
                    }
                }
            }
            event => match stack.last_mut() {
                Some(buffer) => buffer.push(event).map_err(|e| xml_err(e.to_string()))?,
                None => writer
                    .write_event(event)
                    .map_err(|e| xml_err(e.to_string()))?,
            },
        }
    }

    String::from_utf8(writer.into_inner()).map_err(|e| xml_err(e.to_string()))
}
