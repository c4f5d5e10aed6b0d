//! Patch controller: format detection, the worker loop, and the shared
//! progress record.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use crate::bps::{BpsDecoder, BPS_MARKER};
use crate::ips::{IpsDecoder, IPS_MARKER};
use crate::patch_format::{
    IterStatus, PatchCommand, PatchError, PatchKind, PatchStatus, Step,
};

/// Per-format decoder state, resolved once the patch kind is known.
enum PatchContext {
    Ips(IpsDecoder),
    Bps(BpsDecoder),
}

impl PatchContext {
    fn next(&mut self) -> Result<Step, PatchError> {
        match self {
            PatchContext::Ips(decoder) => decoder.next(),
            PatchContext::Bps(decoder) => decoder.next(),
        }
    }

    fn end(self) -> Result<(), PatchError> {
        match self {
            // IPS has no trailer; the output is complete once the hunks
            // run dry.
            PatchContext::Ips(_) => Ok(()),
            PatchContext::Bps(decoder) => decoder.end(),
        }
    }
}

fn read_marker<const N: usize>(patch_file: &mut File) -> Result<Option<[u8; N]>, PatchError> {
    patch_file.seek(SeekFrom::Start(0))?;
    let mut marker = [0u8; N];
    match patch_file.read_exact(&mut marker) {
        Ok(()) => Ok(Some(marker)),
        // A patch shorter than the marker is simply not this format.
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(None),
        Err(e) => Err(PatchError::Io(e)),
    }
}

/// Sniff the patch format from its marker bytes: IPS first, then BPS,
/// with a rewind between attempts. The position is back at the start on
/// return; each decoder re-reads its own marker.
pub fn detect_patch_kind(patch_file: &mut File) -> Result<PatchKind, PatchError> {
    let kind = if read_marker::<5>(patch_file)?.as_ref() == Some(IPS_MARKER) {
        PatchKind::Ips
    } else if read_marker::<4>(patch_file)?.as_ref() == Some(BPS_MARKER) {
        PatchKind::Bps
    } else {
        return Err(PatchError::UnknownType);
    };
    patch_file.seek(SeekFrom::Start(0))?;
    log::info!("detected patch type: {kind:?}");
    Ok(kind)
}

fn publish(shared: &Mutex<PatchStatus>, local: &PatchStatus) {
    let mut status = shared.lock().expect("patch status lock poisoned");
    *status = local.clone();
}

/// Apply one patch command, publishing progress to `shared` at every hunk
/// boundary. Returns the number of hunks written.
///
/// The terminal snapshot (with `is_done` set and the error kind, if any)
/// is published on every exit path; file handles close by drop the same
/// way.
pub fn apply_patch(
    command: &PatchCommand,
    shared: &Mutex<PatchStatus>,
) -> Result<u64, PatchError> {
    let mut local = PatchStatus::default();
    let result = run_patch(command, shared, &mut local);
    if let Err(err) = &result {
        local.err = Some(err.kind());
        if local.iter_status != IterStatus::IoError {
            local.iter_status = IterStatus::Done;
        }
        log::error!("patching failed: {err}");
    }
    local.is_done = true;
    publish(shared, &local);
    result.map(|()| local.hunk_count)
}

fn run_patch(
    command: &PatchCommand,
    shared: &Mutex<PatchStatus>,
    local: &mut PatchStatus,
) -> Result<(), PatchError> {
    let input_file = File::open(&command.input_file)?;
    let output_file = File::create(&command.output_file)?;
    let mut patch_file = File::open(&command.patch_file)?;

    let kind = detect_patch_kind(&mut patch_file)?;

    let mut ctx = match kind {
        PatchKind::Ips => PatchContext::Ips(
            IpsDecoder::start(input_file, patch_file, output_file)
                .map_err(|e| PatchError::FailedToStart(Box::new(e)))?,
        ),
        PatchKind::Bps => PatchContext::Bps(
            BpsDecoder::start(&input_file, patch_file, output_file)
                .map_err(|e| PatchError::FailedToStart(Box::new(e)))?,
        ),
    };

    loop {
        match ctx.next() {
            Ok(Step::Next) => {
                local.hunk_count += 1;
                local.iter_status = IterStatus::Next;
                publish(shared, local);
            }
            Ok(Step::Done) => {
                local.iter_status = IterStatus::Done;
                publish(shared, local);
                break;
            }
            Err(err) => {
                local.iter_status = IterStatus::IoError;
                log::error!("hunk iteration failed at hunk {}: {err}", local.hunk_count);
                return Err(err);
            }
        }
    }

    ctx.end()
}

/// Run [`apply_patch`] on its own worker thread. The observer polls
/// `status` at its own cadence and joins after seeing `is_done`.
pub fn spawn_patch_worker(
    command: PatchCommand,
    status: Arc<Mutex<PatchStatus>>,
) -> JoinHandle<Result<u64, PatchError>> {
    thread::spawn(move || apply_patch(&command, &status))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patch_format::PatchErrorKind;
    use quickcheck::{quickcheck, TestResult};
    use std::fs;
    use std::io::Write;
    use std::time::Duration;

    fn command(dir: &std::path::Path, source: &[u8], patch: &[u8]) -> PatchCommand {
        let command = PatchCommand {
            input_file: dir.join("source.bin"),
            patch_file: dir.join("patch.bin"),
            output_file: dir.join("out.bin"),
        };
        fs::write(&command.input_file, source).unwrap();
        fs::write(&command.patch_file, patch).unwrap();
        command
    }

    #[test]
    fn detects_ips_marker() {
        let mut f = tempfile::tempfile().unwrap();
        f.write_all(b"PATCH and then some").unwrap();
        assert_eq!(detect_patch_kind(&mut f).unwrap(), PatchKind::Ips);
    }

    #[test]
    fn detects_bps_marker_on_second_attempt() {
        let mut f = tempfile::tempfile().unwrap();
        f.write_all(b"BPS1\x80\x80\x80").unwrap();
        assert_eq!(detect_patch_kind(&mut f).unwrap(), PatchKind::Bps);
        // Degenerate but valid header bytes: detection alone must not
        // consume them.
        let mut rest = Vec::new();
        f.seek(SeekFrom::Start(0)).unwrap();
        f.read_to_end(&mut rest).unwrap();
        assert_eq!(rest, b"BPS1\x80\x80\x80");
    }

    #[test]
    fn short_blob_is_unknown() {
        let mut f = tempfile::tempfile().unwrap();
        f.write_all(b"BP").unwrap();
        assert!(matches!(
            detect_patch_kind(&mut f),
            Err(PatchError::UnknownType)
        ));
    }

    #[test]
    fn apply_reports_unknown_type() {
        let dir = tempfile::tempdir().unwrap();
        let command = command(dir.path(), b"rom", b"neither marker");
        let shared = Mutex::new(PatchStatus::default());
        let err = apply_patch(&command, &shared).unwrap_err();
        assert!(matches!(err, PatchError::UnknownType));

        let status = shared.lock().unwrap().clone();
        assert!(status.is_done);
        assert_eq!(status.iter_status, IterStatus::Done);
        assert_eq!(status.err, Some(PatchErrorKind::UnknownType));
    }

    #[test]
    fn apply_reports_io_error_for_missing_input() {
        let dir = tempfile::tempdir().unwrap();
        let command = PatchCommand {
            input_file: dir.path().join("missing.bin"),
            patch_file: dir.path().join("also-missing.ips"),
            output_file: dir.path().join("out.bin"),
        };
        let shared = Mutex::new(PatchStatus::default());
        let err = apply_patch(&command, &shared).unwrap_err();
        assert_eq!(err.kind(), PatchErrorKind::Io);
        assert!(shared.lock().unwrap().is_done);
    }

    #[test]
    fn apply_counts_ips_hunks() {
        let dir = tempfile::tempdir().unwrap();
        let mut patch = b"PATCH".to_vec();
        patch.extend_from_slice(&[0x00, 0x00, 0x01, 0x00, 0x01, 0xaa]);
        patch.extend_from_slice(&[0x00, 0x00, 0x03, 0x00, 0x01, 0xbb]);
        patch.extend_from_slice(b"EOF");
        let command = command(dir.path(), &[0u8; 5], &patch);

        let shared = Mutex::new(PatchStatus::default());
        assert_eq!(apply_patch(&command, &shared).unwrap(), 2);
        assert_eq!(fs::read(&command.output_file).unwrap(), [0x00, 0xaa, 0x00, 0xbb, 0x00]);

        let status = shared.lock().unwrap().clone();
        assert_eq!(status.hunk_count, 2);
        assert_eq!(status.iter_status, IterStatus::Done);
        assert!(status.err.is_none());
        assert!(status.is_done);
    }

    #[test]
    fn truncated_ips_surfaces_as_iter_io_error() {
        let dir = tempfile::tempdir().unwrap();
        // Hunk header promises 4 bytes, stream ends after 1.
        let mut patch = b"PATCH".to_vec();
        patch.extend_from_slice(&[0x00, 0x00, 0x00, 0x00, 0x04, 0xaa]);
        let command = command(dir.path(), &[0u8; 4], &patch);

        let shared = Mutex::new(PatchStatus::default());
        apply_patch(&command, &shared).unwrap_err();
        let status = shared.lock().unwrap().clone();
        assert_eq!(status.iter_status, IterStatus::IoError);
        assert_eq!(status.err, Some(PatchErrorKind::Io));
        assert!(status.is_done);
    }

    #[test]
    fn bad_bps_header_is_failed_to_start() {
        let dir = tempfile::tempdir().unwrap();
        // Marker only; the header varints are missing.
        let command = command(dir.path(), b"rom", b"BPS1");
        let shared = Mutex::new(PatchStatus::default());
        let err = apply_patch(&command, &shared).unwrap_err();
        assert!(matches!(err, PatchError::FailedToStart(_)));
        assert_eq!(
            shared.lock().unwrap().err,
            Some(PatchErrorKind::FailedToStart)
        );
    }

    #[test]
    fn worker_publishes_terminal_status() {
        let dir = tempfile::tempdir().unwrap();
        let mut patch = b"PATCH".to_vec();
        patch.extend_from_slice(&[0x00, 0x00, 0x01, 0x00, 0x01, 0xaa]);
        patch.extend_from_slice(b"EOF");
        let command = command(dir.path(), &[0u8; 3], &patch);
        let output_file = command.output_file.clone();

        let status = Arc::new(Mutex::new(PatchStatus::default()));
        let worker = spawn_patch_worker(command, Arc::clone(&status));

        let mut snapshot = PatchStatus::default();
        for _ in 0..500 {
            snapshot = status.lock().unwrap().clone();
            if snapshot.is_done {
                break;
            }
            thread::sleep(Duration::from_millis(1));
        }
        assert!(snapshot.is_done, "worker never published a terminal status");
        assert_eq!(snapshot.iter_status, IterStatus::Done);
        assert_eq!(snapshot.hunk_count, 1);
        assert!(snapshot.err.is_none());

        assert_eq!(worker.join().unwrap().unwrap(), 1);
        assert_eq!(fs::read(output_file).unwrap(), [0x00, 0xaa, 0x00]);
    }

    quickcheck! {
        fn unknown_blobs_are_rejected(data: Vec<u8>) -> TestResult {
            if data.starts_with(b"PATCH") || data.starts_with(b"BPS1") {
                return TestResult::discard();
            }
            let mut f = tempfile::tempfile().unwrap();
            f.write_all(&data).unwrap();
            TestResult::from_bool(matches!(
                detect_patch_kind(&mut f),
                Err(PatchError::UnknownType)
            ))
        }
    }
}
