//! NZB manifest codec
//!
//! Parses NZB 1.1 XML into the data model, classifies par2 sidecars, and
//! serializes the model back with structural fidelity: file order, segment
//! numbering, and group lists survive a round trip verbatim.

mod parser;
mod writer;

pub use parser::parse;
pub use writer::write;

use regex::Regex;
use std::sync::LazyLock;

/// Matches par2 index files and repair volumes, case-insensitively:
/// `foo.par2`, `foo.vol003+07.PAR2`, ...
static PAR2_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(\.vol\d+\+\d+)?\.par2$").expect("valid regex"));

/// One numbered chunk of a file posted as a single article
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Segment {
    /// Article message-id without angle brackets
    pub id: String,
    /// 1-based position within the file
    pub number: u32,
    /// Advertised size in bytes
    pub bytes: u64,
}

/// One file enumerated by the manifest
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NzbFile {
    /// Filename extracted from the subject line
    pub filename: String,
    /// Filename with par2 suffixes and the final extension stripped
    pub base_filename: String,
    /// Raw subject line
    pub subject: String,
    /// Poster address
    pub poster: String,
    /// Posting date as a Unix timestamp
    pub date: i64,
    /// 1-based file number within the posting
    pub number: u32,
    /// Total number of files advertised by the posting
    pub total_files: u32,
    /// Newsgroups the articles were posted to
    pub groups: Vec<String>,
    /// Segments ordered by number
    pub segments: Vec<Segment>,
    /// Sum of advertised segment sizes
    pub bytes: u64,
}

/// A parsed NZB manifest: an ordered list of files
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Nzb {
    /// Files in manifest order
    pub files: Vec<NzbFile>,
    /// Total file count across the posting
    pub total_files: u32,
}

/// Returns true when the filename names a par2 index or repair volume
pub fn is_par2_filename(filename: &str) -> bool {
    PAR2_RE.is_match(filename)
}

/// Split a manifest into par2 sidecar indices and payload indices.
///
/// Every file lands in exactly one of the two lists, in manifest order.
pub fn partition_par_files(nzb: &Nzb) -> (Vec<usize>, Vec<usize>) {
    let mut par_files = Vec::new();
    let mut rest_files = Vec::new();
    for (i, file) in nzb.files.iter().enumerate() {
        if is_par2_filename(&file.filename) {
            par_files.push(i);
        } else {
            rest_files.push(i);
        }
    }
    (par_files, rest_files)
}

/// Strip par2 suffixes and the final extension from a filename
pub(crate) fn base_filename(filename: &str) -> String {
    let stripped = PAR2_RE.replace(filename, "");
    match stripped.rfind('.') {
        Some(i) if i > 0 => stripped[..i].to_string(),
        _ => stripped.into_owned(),
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn file(filename: &str) -> NzbFile {
        NzbFile {
            filename: filename.to_string(),
            base_filename: base_filename(filename),
            subject: format!("\"{filename}\" yEnc (1/1)"),
            poster: "poster@example.com".to_string(),
            date: 1_678_886_400,
            number: 1,
            total_files: 1,
            groups: vec!["alt.binaries.test".to_string()],
            segments: vec![Segment {
                id: "seg@test".to_string(),
                number: 1,
                bytes: 100,
            }],
            bytes: 100,
        }
    }

    #[test]
    fn par2_filenames_match_case_insensitively() {
        assert!(is_par2_filename("movie.par2"));
        assert!(is_par2_filename("movie.PAR2"));
        assert!(is_par2_filename("movie.vol003+07.par2"));
        assert!(is_par2_filename("movie.VOL000+01.PAR2"));
        assert!(!is_par2_filename("movie.mkv"));
        assert!(!is_par2_filename("movie.par2.rar"));
        assert!(!is_par2_filename("movie.vol3.par"));
    }

    #[test]
    fn partition_is_sound() {
        let nzb = Nzb {
            files: vec![
                file("a.mkv"),
                file("a.mkv.par2"),
                file("a.mkv.vol000+01.par2"),
                file("b.rar"),
            ],
            total_files: 4,
        };
        let (par_files, rest_files) = partition_par_files(&nzb);

        assert_eq!(par_files, vec![1, 2]);
        assert_eq!(rest_files, vec![0, 3]);

        // Every index appears exactly once across the two lists
        let mut all: Vec<usize> = par_files.iter().chain(rest_files.iter()).copied().collect();
        all.sort_unstable();
        assert_eq!(all, vec![0, 1, 2, 3]);
    }

    #[test]
    fn base_filename_strips_par2_suffixes_and_extension() {
        assert_eq!(base_filename("show.mkv"), "show");
        assert_eq!(base_filename("show.mkv.par2"), "show");
        assert_eq!(base_filename("show.mkv.vol000+01.par2"), "show");
        assert_eq!(base_filename("archive.part01.rar"), "archive.part01");
        assert_eq!(base_filename("noext"), "noext");
    }
}
