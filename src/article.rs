//! Outgoing article codec
//!
//! Builds the RFC-822-style byte stream for re-posting a recovered
//! segment: a CRLF-terminated header block, a blank line, yEnc framing
//! around the encoded body, and a CRC32 footer computed over the
//! plaintext segment bytes.

use chrono::{DateTime, Utc};
use rand::Rng;

use crate::yenc::{Encoder, LINE_LENGTH};

const MESSAGE_ID_CHARSET: &[u8] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

/// An article about to be posted
#[derive(Debug, Clone)]
pub struct Article {
    /// 1-based part number of this segment
    pub part_num: u64,
    /// Total number of parts in the file
    pub part_total: u64,
    /// Size of this part in bytes
    pub part_size: u64,
    /// 0-based byte offset of the part within the file
    pub part_begin: u64,
    /// Exclusive end offset of the part within the file
    pub part_end: u64,
    /// 1-based file number within the posting
    pub file_num: u32,
    /// Total number of files in the posting
    pub file_total: u32,
    /// Size of the whole file in bytes
    pub file_size: u64,
    /// Subject header value
    pub subject: String,
    /// From header value
    pub poster: String,
    /// Newsgroups to post to
    pub groups: Vec<String>,
    /// Message-id without angle brackets
    pub message_id: String,
    /// Filename carried in the yEnc header
    pub filename: String,
    /// Date header; current UTC when absent
    pub date: Option<DateTime<Utc>>,
    /// Extra headers appended after the standard set
    pub custom_headers: Vec<(String, String)>,
    /// Plaintext segment bytes
    pub body: Vec<u8>,
}

impl Article {
    /// Encode the article into a postable byte stream.
    ///
    /// Header order is not significant on the wire but is kept
    /// deterministic here. The `pcrc32` footer is the IEEE CRC32 of the
    /// plaintext body, eight uppercase hex digits.
    pub fn encode(&self, encoder: &dyn Encoder) -> Vec<u8> {
        let date = self.date.unwrap_or_else(Utc::now);

        let mut header = String::new();
        header.push_str(&format!("Subject: {}\r\n", self.subject));
        header.push_str(&format!("From: {}\r\n", self.poster));
        header.push_str(&format!("Newsgroups: {}\r\n", self.groups.join(",")));
        header.push_str(&format!("Message-ID: <{}>\r\n", self.message_id));
        header.push_str(&format!(
            "Date: {}\r\n",
            date.format("%a, %d %b %Y %H:%M:%S GMT")
        ));
        for (key, value) in &self.custom_headers {
            header.push_str(&format!("{key}: {value}\r\n"));
        }
        header.push_str(&format!(
            "\r\n=ybegin part={} total={} line={} size={} name={}\r\n",
            self.part_num, self.part_total, LINE_LENGTH, self.file_size, self.filename
        ));
        header.push_str(&format!(
            "=ypart begin={} end={}\r\n",
            self.part_begin + 1,
            self.part_end
        ));

        let encoded = encoder.encode(&self.body);
        let footer = format!(
            "\r\n=yend size={} part={} pcrc32={:08X}\r\n",
            self.part_size,
            self.part_num,
            crc32fast::hash(&self.body)
        );

        let mut out = Vec::with_capacity(header.len() + encoded.len() + footer.len());
        out.extend_from_slice(header.as_bytes());
        out.extend_from_slice(&encoded);
        out.extend_from_slice(footer.as_bytes());
        out
    }
}

/// Fresh random message-id: `<32 chars>@<8 chars>.<3 chars>`, base62
pub fn random_message_id() -> String {
    format!(
        "{}@{}.{}",
        random_string(32),
        random_string(8),
        random_string(3)
    )
}

/// Random base62 string of the given length
pub fn random_string(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| MESSAGE_ID_CHARSET[rng.gen_range(0..MESSAGE_ID_CHARSET.len())] as char)
        .collect()
}
