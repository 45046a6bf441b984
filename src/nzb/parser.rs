//! Streaming NZB parser built on quick-xml

use std::sync::LazyLock;

use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};
use regex::Regex;

use crate::error::{Error, Result};

use super::{Nzb, NzbFile, Segment, base_filename};

/// Quoted filename with an extension, e.g. `"distro.part01.rar"`
static FILENAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""([^"]+\.[a-zA-Z0-9]{2,4})""#).expect("valid regex"));

/// `[n/m]` or `(n/m)` file counter in the subject
static FILE_COUNT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[\[(](\d+)/(\d+)[\])]").expect("valid regex"));

#[derive(Debug, Clone, Copy)]
enum ParseState {
    Initial,
    InNzb,
    InHead,
    InFile,
    InGroups,
    InGroup,
    InSegments,
    InSegment { bytes: u64, number: u32 },
}

#[derive(Debug)]
struct FileBuilder {
    poster: String,
    date: i64,
    subject: String,
    groups: Vec<String>,
    segments: Vec<Segment>,
}

/// Parse NZB XML bytes into the data model.
///
/// Files keep manifest order; segments are sorted by number. A file without
/// groups or without segments is rejected.
pub fn parse(data: &[u8]) -> Result<Nzb> {
    let mut reader = Reader::from_reader(data);
    reader.config_mut().trim_text(true);

    let mut state = ParseState::Initial;
    let mut files: Vec<NzbFile> = Vec::new();
    let mut current: Option<FileBuilder> = None;
    let mut text = String::new();
    let mut saw_nzb = false;
    let mut buf = Vec::with_capacity(4096);

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => {
                if e.name().as_ref() == b"nzb" {
                    saw_nzb = true;
                }
                text.clear();
                state = handle_start(state, e, &mut current)?;
            }
            Ok(Event::End(ref e)) => {
                state = handle_end(state, e.name().as_ref(), &mut current, &mut files, &mut text)?;
            }
            Ok(Event::Text(ref e)) => {
                text.push_str(
                    &e.unescape()
                        .map_err(|e| Error::InvalidNzb(e.to_string()))?,
                );
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => return Err(Error::InvalidNzb(e.to_string())),
        }
        buf.clear();
    }

    if !saw_nzb {
        return Err(Error::InvalidNzb("missing nzb root element".to_string()));
    }
    if files.is_empty() {
        return Err(Error::InvalidNzb("manifest contains no files".to_string()));
    }

    finish(files)
}

fn handle_start(
    state: ParseState,
    e: &BytesStart,
    current: &mut Option<FileBuilder>,
) -> Result<ParseState> {
    let next = match (&state, e.name().as_ref()) {
        (ParseState::Initial, b"nzb") => ParseState::InNzb,
        (ParseState::InNzb, b"head") => ParseState::InHead,
        (ParseState::InNzb, b"file") => {
            *current = Some(FileBuilder {
                poster: get_attr(e, b"poster")?.unwrap_or_default(),
                date: get_attr(e, b"date")?
                    .and_then(|s| s.parse::<i64>().ok())
                    .unwrap_or(0),
                subject: get_attr(e, b"subject")?.unwrap_or_default(),
                groups: Vec::new(),
                segments: Vec::new(),
            });
            ParseState::InFile
        }
        (ParseState::InFile, b"groups") => ParseState::InGroups,
        (ParseState::InGroups, b"group") => ParseState::InGroup,
        (ParseState::InFile, b"segments") => ParseState::InSegments,
        (ParseState::InSegments, b"segment") => {
            let bytes = get_attr(e, b"bytes")?
                .and_then(|s| s.parse::<u64>().ok())
                .ok_or_else(|| Error::InvalidNzb("segment missing bytes attribute".to_string()))?;
            let number = get_attr(e, b"number")?
                .and_then(|s| s.parse::<u32>().ok())
                .ok_or_else(|| Error::InvalidNzb("segment missing number attribute".to_string()))?;
            ParseState::InSegment { bytes, number }
        }
        _ => state,
    };
    Ok(next)
}

fn handle_end(
    state: ParseState,
    tag: &[u8],
    current: &mut Option<FileBuilder>,
    files: &mut Vec<NzbFile>,
    text: &mut String,
) -> Result<ParseState> {
    let next = match (&state, tag) {
        (ParseState::InHead, b"head") => ParseState::InNzb,
        (ParseState::InGroup, b"group") => {
            if let Some(ref mut f) = current {
                f.groups.push(std::mem::take(text));
            }
            ParseState::InGroups
        }
        (ParseState::InGroups, b"groups") => ParseState::InFile,
        (ParseState::InSegment { bytes, number }, b"segment") => {
            let id = std::mem::take(text);
            if id.is_empty() {
                return Err(Error::InvalidNzb("segment missing message-id".to_string()));
            }
            if let Some(ref mut f) = current {
                f.segments.push(Segment {
                    id,
                    number: *number,
                    bytes: *bytes,
                });
            }
            ParseState::InSegments
        }
        (ParseState::InSegments, b"segments") => ParseState::InFile,
        (ParseState::InFile, b"file") => {
            if let Some(builder) = current.take() {
                if builder.groups.is_empty() {
                    return Err(Error::InvalidNzb("file has no groups".to_string()));
                }
                if builder.segments.is_empty() {
                    return Err(Error::InvalidNzb("file has no segments".to_string()));
                }
                files.push(build_file(builder, files.len()));
            }
            ParseState::InNzb
        }
        (ParseState::InNzb, b"nzb") => ParseState::Initial,
        _ => state,
    };
    Ok(next)
}

fn get_attr(e: &BytesStart, name: &[u8]) -> Result<Option<String>> {
    for attr in e.attributes().flatten() {
        if attr.key.as_ref() == name {
            return Ok(Some(
                attr.unescape_value()
                    .map_err(|e| Error::InvalidNzb(e.to_string()))?
                    .into_owned(),
            ));
        }
    }
    Ok(None)
}

fn build_file(builder: FileBuilder, index: usize) -> NzbFile {
    let filename = extract_filename(&builder.subject)
        .unwrap_or_else(|| builder.subject.trim().to_string());
    let (number, total_files) =
        extract_file_count(&builder.subject).unwrap_or((index as u32 + 1, 0));
    let bytes = builder.segments.iter().map(|s| s.bytes).sum();

    NzbFile {
        base_filename: base_filename(&filename),
        filename,
        subject: builder.subject,
        poster: builder.poster,
        date: builder.date,
        number,
        total_files,
        groups: builder.groups,
        segments: builder.segments,
        bytes,
    }
}

fn finish(mut files: Vec<NzbFile>) -> Result<Nzb> {
    let mut total_files = files.len() as u32;
    for file in &mut files {
        file.segments.sort_by_key(|s| s.number);
        for (i, segment) in file.segments.iter().enumerate() {
            if segment.number != i as u32 + 1 {
                return Err(Error::InvalidNzb(format!(
                    "file {:?} has a gap in segment numbering at {}",
                    file.filename, segment.number
                )));
            }
        }
        total_files = total_files.max(file.total_files);
    }
    for file in &mut files {
        file.total_files = total_files;
    }
    Ok(Nzb { files, total_files })
}

/// Extract the quoted filename from a subject line
pub(crate) fn extract_filename(subject: &str) -> Option<String> {
    if let Some(cap) = FILENAME_RE.captures_iter(subject).last() {
        return Some(cap[1].to_string());
    }
    // No extension-shaped quoted token; fall back to any quoted string
    let start = subject.find('"')?;
    let end = subject[start + 1..].find('"')?;
    let name = &subject[start + 1..start + 1 + end];
    (!name.is_empty()).then(|| name.to_string())
}

/// Extract `(number, total)` from a `[n/m]` or `(n/m)` subject token
fn extract_file_count(subject: &str) -> Option<(u32, u32)> {
    let cap = FILE_COUNT_RE.captures(subject)?;
    let number = cap[1].parse().ok()?;
    let total = cap[2].parse().ok()?;
    Some((number, total))
}
