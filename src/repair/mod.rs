//! Per-NZB repair pipeline
//!
//! Download what survives, collect what is gone, let par2 rebuild the
//! damaged files, re-post the recovered segments under fresh message-ids,
//! and rewrite the manifest to match.

mod download;
mod upload;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::nntp::ArticlePool;
use crate::nzb::{self, partition_par_files};
use crate::par2::Par2Runner;

use download::download_file;
use upload::replace_broken_segments;

/// A segment whose article no provider carries, addressed by index into
/// the parsed manifest
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BrokenSegment {
    /// Index into `nzb.files`
    pub file_index: usize,
    /// Index into that file's `segments`
    pub segment_index: usize,
}

/// Deletes the per-job working directory on every exit path
struct WorkDirGuard(PathBuf);

impl Drop for WorkDirGuard {
    fn drop(&mut self) {
        info!(path = %self.0.display(), "cleaning up working directory");
        if let Err(e) = std::fs::remove_dir_all(&self.0) {
            if e.kind() != std::io::ErrorKind::NotFound {
                error!(path = %self.0.display(), error = %e, "failed to clean up working directory");
            }
        }
    }
}

/// Repair a single NZB manifest.
///
/// Succeeds without writing output when the manifest has no par2
/// sidecars, no payload files, or no broken segments. A cancelled run
/// returns `Ok` — the caller logs the shutdown. The working directory is
/// created on entry and removed on every exit path; a pre-existing
/// payload file in it is not re-downloaded, which makes an interrupted
/// run resumable.
#[allow(clippy::too_many_arguments)]
pub async fn repair_nzb(
    token: &CancellationToken,
    cfg: &Config,
    download_pool: Arc<dyn ArticlePool>,
    upload_pool: Arc<dyn ArticlePool>,
    par2: &dyn Par2Runner,
    nzb_path: &Path,
    output_file: Option<&Path>,
    work_dir: &Path,
) -> Result<()> {
    let content = tokio::fs::read(nzb_path).await?;
    let mut nzb = nzb::parse(&content)?;

    let (par_files, rest_files) = partition_par_files(&nzb);
    if par_files.is_empty() {
        info!("no par2 files found in NZB, stopping repair");
        return Ok(());
    }
    if rest_files.is_empty() {
        info!("no payload files to repair, stopping repair");
        return Ok(());
    }

    tokio::fs::create_dir_all(work_dir).await?;
    let _cleanup = WorkDirGuard(work_dir.to_path_buf());

    // Single consumer buckets broken-segment events by file; it only
    // finishes once every sender is dropped, so late events are never
    // lost.
    let (broken_tx, mut broken_rx) = mpsc::unbounded_channel::<BrokenSegment>();
    let collector = tokio::spawn(async move {
        let mut by_file: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        while let Some(segment) = broken_rx.recv().await {
            by_file
                .entry(segment.file_index)
                .or_default()
                .push(segment.segment_index);
        }
        by_file
    });

    let start = std::time::Instant::now();
    for &file_index in &rest_files {
        if token.is_cancelled() {
            break;
        }
        if let Err(e) = download_file(
            token,
            cfg.download_workers,
            &download_pool,
            &mut nzb.files[file_index],
            file_index,
            Some(&broken_tx),
            work_dir,
        )
        .await
        {
            // Partial progress is valuable; move on to the next file
            warn!(file = %nzb.files[file_index].filename, error = %e, "failed to download file");
        }
    }

    drop(broken_tx);
    let broken = collector
        .await
        .map_err(|e| Error::Other(format!("broken-segment collector panicked: {e}")))?;

    if token.is_cancelled() {
        info!("repair cancelled");
        return Ok(());
    }

    info!(
        files = rest_files.len(),
        elapsed = ?start.elapsed(),
        "payload download finished"
    );

    if broken.is_empty() {
        info!("no broken segments found, stopping repair");
        return Ok(());
    }

    let broken_count: usize = broken.values().map(Vec::len).sum();
    info!(count = broken_count, "broken segments found, downloading par2 files");
    for &file_index in &par_files {
        if token.is_cancelled() {
            return Ok(());
        }
        if let Err(e) = download_file(
            token,
            cfg.download_workers,
            &download_pool,
            &mut nzb.files[file_index],
            file_index,
            None,
            work_dir,
        )
        .await
        {
            warn!(file = %nzb.files[file_index].filename, error = %e, "failed to download par2 file");
        }
    }

    if let Err(e) = par2.repair(token, work_dir).await {
        // A partial repair can still make some uploads meaningful
        error!(error = %e, "par2 repair failed");
    }

    let upload_start = std::time::Instant::now();
    replace_broken_segments(token, cfg, &upload_pool, &mut nzb, &broken, work_dir).await?;

    if token.is_cancelled() {
        info!("repair cancelled before manifest rewrite");
        return Ok(());
    }

    let output_path = match output_file {
        Some(path) => path.to_path_buf(),
        None => {
            let base = &nzb.files[rest_files[0]].base_filename;
            nzb_path
                .parent()
                .unwrap_or_else(|| Path::new("."))
                .join(format!("{base}.repaired.nzb"))
        }
    };
    if let Some(parent) = output_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let xml = nzb::write(&nzb)?;
    tokio::fs::write(&output_path, xml).await?;

    info!(
        output = %output_path.display(),
        uploaded = broken_count,
        elapsed = ?upload_start.elapsed(),
        "repaired manifest written"
    );
    Ok(())
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::nntp::NntpError;
    use crate::error::Par2Error;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// What a fake pool replies for one message-id
    enum Reply {
        Body(Vec<u8>),
        NotFound,
        Fail,
    }

    /// In-process stand-in for both connection pools
    #[derive(Default)]
    struct FakePool {
        replies: Mutex<HashMap<String, Reply>>,
        fetches: Mutex<Vec<String>>,
        posts: Mutex<Vec<Vec<u8>>>,
    }

    impl FakePool {
        fn with_replies(replies: Vec<(&str, Reply)>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(
                    replies
                        .into_iter()
                        .map(|(id, reply)| (id.to_string(), reply))
                        .collect(),
                ),
                ..Default::default()
            })
        }

        fn fetch_count(&self) -> usize {
            self.fetches.lock().unwrap().len()
        }

        fn post_count(&self) -> usize {
            self.posts.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl ArticlePool for FakePool {
        async fn fetch_body(
            &self,
            _token: &CancellationToken,
            message_id: &str,
            _groups: &[String],
        ) -> std::result::Result<Vec<u8>, NntpError> {
            self.fetches.lock().unwrap().push(message_id.to_string());
            match self.replies.lock().unwrap().get(message_id) {
                Some(Reply::Body(body)) => Ok(body.clone()),
                Some(Reply::NotFound) | None => {
                    Err(NntpError::ArticleNotFound(message_id.to_string()))
                }
                Some(Reply::Fail) => {
                    Err(NntpError::ProtocolError("connection reset".to_string()))
                }
            }
        }

        async fn post(
            &self,
            _token: &CancellationToken,
            article: &[u8],
        ) -> std::result::Result<(), NntpError> {
            self.posts.lock().unwrap().push(article.to_vec());
            Ok(())
        }

        async fn close(&self) {}
    }

    /// Par2 stand-in: writes configured file contents into the working
    /// directory, or fails with a configured exit status
    struct FakePar2 {
        write_files: Vec<(String, Vec<u8>)>,
        result: std::result::Result<(), (i32, &'static str)>,
        calls: Mutex<usize>,
    }

    impl FakePar2 {
        fn succeeding(write_files: Vec<(String, Vec<u8>)>) -> Self {
            Self {
                write_files,
                result: Ok(()),
                calls: Mutex::new(0),
            }
        }

        fn failing(code: i32, name: &'static str) -> Self {
            Self {
                write_files: Vec::new(),
                result: Err((code, name)),
                calls: Mutex::new(0),
            }
        }

        fn call_count(&self) -> usize {
            *self.calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl Par2Runner for FakePar2 {
        async fn repair(
            &self,
            _token: &CancellationToken,
            dir: &Path,
        ) -> std::result::Result<(), Par2Error> {
            *self.calls.lock().unwrap() += 1;
            for (name, content) in &self.write_files {
                std::fs::write(dir.join(name), content).unwrap();
            }
            match self.result {
                Ok(()) => Ok(()),
                Err((code, name)) => Err(Par2Error::ExitStatus {
                    code,
                    name,
                    stderr: "simulated".to_string(),
                }),
            }
        }
    }

    fn write_nzb_fixture(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, body).unwrap();
        path
    }

    /// One payload file with two segments and one par2 sidecar
    fn two_segment_manifest(seg_bytes: usize) -> String {
        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE nzb PUBLIC "-//newzBin//DTD NZB 1.1//EN" "http://www.newzbin.com/DTD/nzb/nzb-1.1.dtd">
<nzb xmlns="http://www.newzbin.com/DTD/2003/nzb">
 <file poster="test@example.com" date="1678886400" subject="[1/2] rel - &quot;test.mkv&quot; yEnc (1/2)">
  <groups><group>alt.binaries.test</group></groups>
  <segments>
   <segment bytes="{seg_bytes}" number="1">segment1@test</segment>
   <segment bytes="{seg_bytes}" number="2">segment2@test</segment>
  </segments>
 </file>
 <file poster="test@example.com" date="1678886400" subject="[2/2] rel - &quot;test.mkv.par2&quot; yEnc (1/1)">
  <groups><group>alt.binaries.test</group></groups>
  <segments>
   <segment bytes="50" number="1">parsegment1@test</segment>
  </segments>
 </file>
</nzb>"#
        )
    }

    fn test_config() -> Config {
        Config {
            download_workers: 1,
            upload_workers: 1,
            ..Default::default()
        }
        .merge_with_defaults()
    }

    #[tokio::test]
    async fn no_par2_sidecar_short_circuits_without_network_calls() {
        let input = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();
        let output = input.path().join("out.nzb");

        let nzb_path = write_nzb_fixture(
            input.path(),
            "plain.nzb",
            r#"<?xml version="1.0"?>
<nzb xmlns="http://www.newzbin.com/DTD/2003/nzb">
 <file poster="p" date="1" subject="[1/1] - &quot;data.mkv&quot; yEnc (1/1)">
  <groups><group>alt.binaries.test</group></groups>
  <segments><segment bytes="100" number="1">data@test</segment></segments>
 </file>
</nzb>"#,
        );

        let download = FakePool::with_replies(vec![]);
        let upload = FakePool::with_replies(vec![]);
        let par2 = FakePar2::succeeding(vec![]);

        repair_nzb(
            &CancellationToken::new(),
            &test_config(),
            download.clone(),
            upload.clone(),
            &par2,
            &nzb_path,
            Some(&output),
            &work.path().join("job"),
        )
        .await
        .unwrap();

        assert!(!output.exists(), "no output manifest may be written");
        assert_eq!(download.fetch_count(), 0, "no articles may be fetched");
        assert_eq!(upload.post_count(), 0, "nothing may be posted");
        assert_eq!(par2.call_count(), 0, "par2 must not run");
    }

    #[tokio::test]
    async fn only_par2_files_short_circuits() {
        let input = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();

        let nzb_path = write_nzb_fixture(
            input.path(),
            "paronly.nzb",
            r#"<?xml version="1.0"?>
<nzb xmlns="http://www.newzbin.com/DTD/2003/nzb">
 <file poster="p" date="1" subject="[1/1] - &quot;data.par2&quot; yEnc (1/1)">
  <groups><group>alt.binaries.test</group></groups>
  <segments><segment bytes="100" number="1">par@test</segment></segments>
 </file>
</nzb>"#,
        );

        let download = FakePool::with_replies(vec![]);
        let upload = FakePool::with_replies(vec![]);
        let par2 = FakePar2::succeeding(vec![]);

        repair_nzb(
            &CancellationToken::new(),
            &test_config(),
            download.clone(),
            upload,
            &par2,
            &nzb_path,
            None,
            &work.path().join("job"),
        )
        .await
        .unwrap();

        assert_eq!(download.fetch_count(), 0);
    }

    #[tokio::test]
    async fn intact_manifest_downloads_but_skips_par2_and_rewrite() {
        let input = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();
        let output = input.path().join("out.nzb");

        let nzb_path =
            write_nzb_fixture(input.path(), "intact.nzb", &two_segment_manifest(10));

        let download = FakePool::with_replies(vec![
            ("segment1@test", Reply::Body(b"aaaaaaaaaa".to_vec())),
            ("segment2@test", Reply::Body(b"bbbbbbbbbb".to_vec())),
        ]);
        let upload = FakePool::with_replies(vec![]);
        let par2 = FakePar2::succeeding(vec![]);

        repair_nzb(
            &CancellationToken::new(),
            &test_config(),
            download.clone(),
            upload.clone(),
            &par2,
            &nzb_path,
            Some(&output),
            &work.path().join("job"),
        )
        .await
        .unwrap();

        assert!(!output.exists(), "intact manifest needs no rewrite");
        assert_eq!(download.fetch_count(), 2, "both payload segments fetched");
        assert_eq!(par2.call_count(), 0, "no broken segments, no par2 run");
        assert_eq!(upload.post_count(), 0);
    }

    #[tokio::test]
    async fn broken_segment_is_repaired_reposted_and_remapped() {
        let input = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();
        let output = input.path().join("out.nzb");
        let work_dir = work.path().join("job");

        let seg = b"0123456789";
        let repaired: Vec<u8> = b"REPAIRED__0123456789".to_vec();

        let nzb_path =
            write_nzb_fixture(input.path(), "broken.nzb", &two_segment_manifest(seg.len()));

        let download = FakePool::with_replies(vec![
            ("segment1@test", Reply::NotFound),
            ("segment2@test", Reply::Body(seg.to_vec())),
            ("parsegment1@test", Reply::Body(b"par2 recovery data".to_vec())),
        ]);
        let upload = FakePool::with_replies(vec![]);
        let par2 = FakePar2::succeeding(vec![("test.mkv".to_string(), repaired.clone())]);

        repair_nzb(
            &CancellationToken::new(),
            &test_config(),
            download.clone(),
            upload.clone(),
            &par2,
            &nzb_path,
            Some(&output),
            &work_dir,
        )
        .await
        .unwrap();

        // Par2 ran once, exactly one replacement was posted
        assert_eq!(par2.call_count(), 1);
        assert_eq!(upload.post_count(), 1);

        // The posted article carries the first segment of the repaired file
        let posted = upload.posts.lock().unwrap()[0].clone();
        let posted_text = String::from_utf8_lossy(&posted).into_owned();
        assert!(posted_text.contains("=ybegin part=1"));
        let blank = posted.windows(4).position(|w| w == b"\r\n\r\n").unwrap();
        let body = crate::yenc::decode(&posted[blank + 4..]).unwrap();
        assert_eq!(body, &repaired[..seg.len()]);

        // The output manifest differs from the input only in segment 1's id
        let rewritten = nzb::parse(&std::fs::read(&output).unwrap()).unwrap();
        let file = &rewritten.files[0];
        assert_ne!(file.segments[0].id, "segment1@test", "broken id replaced");
        assert_eq!(file.segments[1].id, "segment2@test", "good id unchanged");
        let new_id = &file.segments[0].id;
        assert_eq!(new_id.find('@'), Some(32), "fresh message-id shape");
        assert!(posted_text.contains(&format!("Message-ID: <{new_id}>")));

        // Working directory is cleaned on exit
        assert!(!work_dir.exists());
    }

    #[tokio::test]
    async fn par2_failure_with_unreadable_segment_fails_the_job() {
        let input = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();
        let output = input.path().join("out.nzb");

        // Segment 2 (the tail of the file) is broken; with par2 failing,
        // the on-disk file stays too short to read the range back out.
        let seg = b"0123456789";
        let nzb_path =
            write_nzb_fixture(input.path(), "dead.nzb", &two_segment_manifest(seg.len()));

        let download = FakePool::with_replies(vec![
            ("segment1@test", Reply::Body(seg.to_vec())),
            ("segment2@test", Reply::NotFound),
            ("parsegment1@test", Reply::Body(b"par2 recovery data".to_vec())),
        ]);
        let upload = FakePool::with_replies(vec![]);
        let par2 = FakePar2::failing(2, "Repair not possible");

        let err = repair_nzb(
            &CancellationToken::new(),
            &test_config(),
            download,
            upload.clone(),
            &par2,
            &nzb_path,
            Some(&output),
            &work.path().join("job"),
        )
        .await
        .unwrap_err();

        assert_eq!(par2.call_count(), 1);
        assert_eq!(upload.post_count(), 0, "nothing postable without repair");
        assert!(matches!(err, Error::Io(_)), "short read surfaces as I/O: {err}");
    }

    #[tokio::test]
    async fn transport_error_on_one_file_does_not_abort_the_manifest() {
        let input = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();

        let nzb_path = write_nzb_fixture(
            input.path(),
            "mixed.nzb",
            r#"<?xml version="1.0"?>
<nzb xmlns="http://www.newzbin.com/DTD/2003/nzb">
 <file poster="p" date="1" subject="[1/3] - &quot;bad.mkv&quot; yEnc (1/1)">
  <groups><group>alt.binaries.test</group></groups>
  <segments><segment bytes="10" number="1">bad@test</segment></segments>
 </file>
 <file poster="p" date="1" subject="[2/3] - &quot;good.mkv&quot; yEnc (1/1)">
  <groups><group>alt.binaries.test</group></groups>
  <segments><segment bytes="10" number="1">good@test</segment></segments>
 </file>
 <file poster="p" date="1" subject="[3/3] - &quot;rel.par2&quot; yEnc (1/1)">
  <groups><group>alt.binaries.test</group></groups>
  <segments><segment bytes="10" number="1">par@test</segment></segments>
 </file>
</nzb>"#,
        );

        let download = FakePool::with_replies(vec![
            ("bad@test", Reply::Fail),
            ("good@test", Reply::Body(b"0123456789".to_vec())),
        ]);
        let upload = FakePool::with_replies(vec![]);
        let par2 = FakePar2::succeeding(vec![]);

        // The transport failure on bad.mkv is logged; good.mkv still
        // downloads; no segments are broken so the run ends successfully.
        repair_nzb(
            &CancellationToken::new(),
            &test_config(),
            download.clone(),
            upload,
            &par2,
            &nzb_path,
            None,
            &work.path().join("job"),
        )
        .await
        .unwrap();

        let fetched = download.fetches.lock().unwrap().clone();
        assert!(fetched.contains(&"good@test".to_string()));
    }

    #[tokio::test]
    async fn cancelled_pipeline_returns_ok_without_output() {
        let input = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();
        let output = input.path().join("out.nzb");

        let nzb_path =
            write_nzb_fixture(input.path(), "cancel.nzb", &two_segment_manifest(10));

        let download = FakePool::with_replies(vec![]);
        let upload = FakePool::with_replies(vec![]);
        let par2 = FakePar2::succeeding(vec![]);

        let token = CancellationToken::new();
        token.cancel();

        repair_nzb(
            &token,
            &test_config(),
            download,
            upload,
            &par2,
            &nzb_path,
            Some(&output),
            &work.path().join("job"),
        )
        .await
        .unwrap();

        assert!(!output.exists());
    }

    #[tokio::test]
    async fn default_output_path_uses_base_filename() {
        let input = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();

        let seg = b"0123456789";
        let nzb_path =
            write_nzb_fixture(input.path(), "in.nzb", &two_segment_manifest(seg.len()));

        let download = FakePool::with_replies(vec![
            ("segment1@test", Reply::NotFound),
            ("segment2@test", Reply::Body(seg.to_vec())),
            ("parsegment1@test", Reply::Body(b"recovery".to_vec())),
        ]);
        let upload = FakePool::with_replies(vec![]);
        let par2 = FakePar2::succeeding(vec![(
            "test.mkv".to_string(),
            b"REPAIRED__0123456789".to_vec(),
        )]);

        repair_nzb(
            &CancellationToken::new(),
            &test_config(),
            download,
            upload,
            &par2,
            &nzb_path,
            None,
            &work.path().join("job"),
        )
        .await
        .unwrap();

        // base_filename of "test.mkv" is "test"
        assert!(input.path().join("test.repaired.nzb").exists());
    }

    #[tokio::test]
    async fn observed_size_overrides_advertised_segment_size() {
        let input = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();
        let output = input.path().join("out.nzb");
        let work_dir = work.path().join("job");

        // Advertised 14 bytes per segment (yEnc article size), actual
        // decoded bodies are 10 bytes. Offsets must use the observed 10.
        let nzb_path = write_nzb_fixture(input.path(), "sizes.nzb", &two_segment_manifest(14));

        let download = FakePool::with_replies(vec![
            ("segment1@test", Reply::Body(b"aaaaaaaaaa".to_vec())),
            ("segment2@test", Reply::NotFound),
            ("parsegment1@test", Reply::Body(b"recovery".to_vec())),
        ]);
        let upload = FakePool::with_replies(vec![]);
        let par2 = FakePar2::succeeding(vec![(
            "test.mkv".to_string(),
            b"aaaaaaaaaabbbbbbbbbb".to_vec(),
        )]);

        repair_nzb(
            &CancellationToken::new(),
            &test_config(),
            download,
            upload.clone(),
            &par2,
            &nzb_path,
            Some(&output),
            &work_dir,
        )
        .await
        .unwrap();

        assert_eq!(upload.post_count(), 1);

        // The re-posted body must be the second 10-byte slice, proving
        // the corrected size reached the upload offset computation
        let posted = upload.posts.lock().unwrap()[0].clone();
        let blank = posted.windows(4).position(|w| w == b"\r\n\r\n").unwrap();
        let body = crate::yenc::decode(&posted[blank + 4..]).unwrap();
        assert_eq!(body, b"bbbbbbbbbb");

        // And the rewritten manifest advertises the corrected size
        let rewritten = nzb::parse(&std::fs::read(&output).unwrap()).unwrap();
        assert_eq!(rewritten.files[0].segments[0].bytes, 10);
        assert_eq!(rewritten.files[0].segments[1].bytes, 10);
    }

    #[tokio::test]
    async fn existing_file_in_work_dir_is_not_redownloaded() {
        let input = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();
        let work_dir = work.path().join("job");

        let nzb_path =
            write_nzb_fixture(input.path(), "resume.nzb", &two_segment_manifest(10));

        // Pre-seed the working directory as a crashed run would leave it
        std::fs::create_dir_all(&work_dir).unwrap();
        std::fs::write(work_dir.join("test.mkv"), b"already here").unwrap();

        let download = FakePool::with_replies(vec![]);
        let upload = FakePool::with_replies(vec![]);
        let par2 = FakePar2::succeeding(vec![]);

        repair_nzb(
            &CancellationToken::new(),
            &test_config(),
            download.clone(),
            upload,
            &par2,
            &nzb_path,
            None,
            &work_dir,
        )
        .await
        .unwrap();

        assert_eq!(
            download.fetch_count(),
            0,
            "pre-existing payload file must skip the download"
        );
    }
}
