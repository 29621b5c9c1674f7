use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::debug;

use crate::error::HookError;

/// Largest ping body the monitoring service accepts.
pub const MAX_PAYLOAD_BYTES: usize = 100_000;

const LOG_DIR: &str = "/var/log/vzdump";

/// Lines containing these were printed by hook scripts, not by the backup.
const HOOK_LINE_MARKERS: &[&str] = &["MESG", "OKhttp"];

/// Where the backup tool writes a guest's log when `LOGFILE` is not set.
pub fn default_log_path(vmtype: &str, vmid: &str) -> PathBuf {
    Path::new(LOG_DIR).join(format!("{}-{}.log", vmtype.to_lowercase(), vmid))
}

/// Read the tail of a log file, at most `max_bytes` long.
///
/// Only the last `max_bytes` are read from disk. Errors usually show up at
/// the end of a backup log, so the head is what gets dropped.
pub async fn capture(path: &Path, max_bytes: usize) -> Result<String, HookError> {
    let read_err = |source| HookError::LogRead {
        path: path.to_path_buf(),
        source,
    };

    let mut file = tokio::fs::File::open(path).await.map_err(read_err)?;
    let len = file.metadata().await.map_err(read_err)?.len();

    let start = len.saturating_sub(max_bytes as u64);
    file.seek(SeekFrom::Start(start)).await.map_err(read_err)?;

    let mut buf = Vec::with_capacity((len - start) as usize);
    file.read_to_end(&mut buf).await.map_err(read_err)?;

    let text = String::from_utf8_lossy(&buf);
    let payload = strip_hook_lines(truncate_tail(&text, max_bytes, start > 0));

    debug!(
        path = %path.display(),
        file_bytes = len,
        payload_bytes = payload.len(),
        "Captured log tail"
    );
    Ok(payload)
}

/// Drop the lines hook scripts wrote into the task log.
pub fn strip_hook_lines(text: &str) -> String {
    text.split_inclusive('\n')
        .filter(|line| !HOOK_LINE_MARKERS.iter().any(|marker| line.contains(marker)))
        .collect()
}

/// Keep the last `max_bytes` of `text`, cut on a char boundary.
///
/// When the text was already cut (`cut` is true or it is still too long),
/// the partial first line is dropped too, unless that would drop everything.
pub fn truncate_tail(text: &str, max_bytes: usize, cut: bool) -> &str {
    let mut start = text.len().saturating_sub(max_bytes);
    while !text.is_char_boundary(start) {
        start += 1;
    }

    let tail = &text[start..];
    if !(cut || start > 0) {
        return tail;
    }

    match tail.find('\n') {
        Some(pos) if pos + 1 < tail.len() => &tail[pos + 1..],
        _ => tail,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_short_text_untouched() {
        assert_eq!(truncate_tail("line1\nline2\n", 100, false), "line1\nline2\n");
    }

    #[test]
    fn test_keeps_tail_from_line_start() {
        let text = "first line\nsecond line\nERROR: disk full\n";
        let tail = truncate_tail(text, 25, false);
        assert_eq!(tail, "ERROR: disk full\n");
        assert!(tail.len() <= 25);
    }

    #[test]
    fn test_single_long_line_keeps_bytes() {
        let text = "a".repeat(50);
        assert_eq!(truncate_tail(&text, 10, false).len(), 10);
    }

    #[test]
    fn test_respects_char_boundaries() {
        let text = "ééééé"; // 2 bytes each
        let tail = truncate_tail(text, 5, false);
        assert_eq!(tail, "éé");
    }

    #[test]
    fn test_strip_hook_lines() {
        let log = "INFO: starting new backup job\n\
                   MESG: 'main:512' job-init -- Create pve1 Endpoint\n\
                   OKhttps://hc.example.com/ping/abc\n\
                   INFO: Finished Backup of VM 101\n\
                   tail without newline";
        assert_eq!(
            strip_hook_lines(log),
            "INFO: starting new backup job\n\
             INFO: Finished Backup of VM 101\n\
             tail without newline"
        );
        assert_eq!(strip_hook_lines(""), "");
    }

    #[tokio::test]
    async fn test_capture_filters_hook_lines() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "INFO: creating vzdump archive").unwrap();
        writeln!(file, "MESG: 'main:540' backup-end -- Ping qemu success").unwrap();
        writeln!(file, "INFO: backup finished").unwrap();

        let payload = capture(file.path(), MAX_PAYLOAD_BYTES).await.unwrap();
        assert_eq!(payload, "INFO: creating vzdump archive\nINFO: backup finished\n");
    }

    #[test]
    fn test_default_log_path() {
        assert_eq!(
            default_log_path("QEMU", "101"),
            PathBuf::from("/var/log/vzdump/qemu-101.log")
        );
    }

    #[tokio::test]
    async fn test_capture_reads_only_tail() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        for i in 0..1000 {
            writeln!(file, "INFO: progress line {}", i).unwrap();
        }
        writeln!(file, "ERROR: backup of VM 101 failed").unwrap();

        let payload = capture(file.path(), 200).await.unwrap();
        assert!(payload.len() <= 200);
        assert!(payload.ends_with("ERROR: backup of VM 101 failed\n"));
        assert!(payload.starts_with("INFO: progress line"));
    }

    #[tokio::test]
    async fn test_capture_small_file_whole() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "only line").unwrap();

        let payload = capture(file.path(), MAX_PAYLOAD_BYTES).await.unwrap();
        assert_eq!(payload, "only line");
    }

    #[tokio::test]
    async fn test_capture_missing_file() {
        let err = capture(Path::new("/nonexistent/vzdump/qemu-1.log"), 100)
            .await
            .unwrap_err();
        assert!(matches!(err, HookError::LogRead { .. }));
        assert!(!err.is_retryable());
    }
}
