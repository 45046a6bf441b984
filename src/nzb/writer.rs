//! NZB serializer
//!
//! Emits standard NZB 1.1 XML that re-parses into a structurally equal
//! manifest: file order, group lists, and segment numbering are preserved
//! verbatim.

use quick_xml::Writer;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};

use crate::error::{Error, Result};

use super::Nzb;

const DOCTYPE: &str = r#" nzb PUBLIC "-//newzBin//DTD NZB 1.1//EN" "http://www.newzbin.com/DTD/nzb/nzb-1.1.dtd""#;
const XMLNS: &str = "http://www.newzbin.com/DTD/2003/nzb";

fn emit(writer: &mut Writer<Vec<u8>>, event: Event<'_>) -> Result<()> {
    writer
        .write_event(event)
        .map_err(|e| Error::InvalidNzb(format!("failed to serialize manifest: {e}")))
}

/// Serialize a manifest to NZB 1.1 XML
pub fn write(nzb: &Nzb) -> Result<Vec<u8>> {
    let mut w = Writer::new_with_indent(Vec::new(), b' ', 2);

    emit(&mut w, Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;
    emit(&mut w, Event::DocType(BytesText::from_escaped(DOCTYPE)))?;

    let mut root = BytesStart::new("nzb");
    root.push_attribute(("xmlns", XMLNS));
    emit(&mut w, Event::Start(root))?;

    for file in &nzb.files {
        let mut start = BytesStart::new("file");
        start.push_attribute(("poster", file.poster.as_str()));
        start.push_attribute(("date", file.date.to_string().as_str()));
        start.push_attribute(("subject", file.subject.as_str()));
        emit(&mut w, Event::Start(start))?;

        emit(&mut w, Event::Start(BytesStart::new("groups")))?;
        for group in &file.groups {
            emit(&mut w, Event::Start(BytesStart::new("group")))?;
            emit(&mut w, Event::Text(BytesText::new(group)))?;
            emit(&mut w, Event::End(BytesEnd::new("group")))?;
        }
        emit(&mut w, Event::End(BytesEnd::new("groups")))?;

        emit(&mut w, Event::Start(BytesStart::new("segments")))?;
        for segment in &file.segments {
            let mut seg = BytesStart::new("segment");
            seg.push_attribute(("bytes", segment.bytes.to_string().as_str()));
            seg.push_attribute(("number", segment.number.to_string().as_str()));
            emit(&mut w, Event::Start(seg))?;
            emit(&mut w, Event::Text(BytesText::new(&segment.id)))?;
            emit(&mut w, Event::End(BytesEnd::new("segment")))?;
        }
        emit(&mut w, Event::End(BytesEnd::new("segments")))?;

        emit(&mut w, Event::End(BytesEnd::new("file")))?;
    }

    emit(&mut w, Event::End(BytesEnd::new("nzb")))?;

    let mut out = w.into_inner();
    out.push(b'\n');
    Ok(out)
}
