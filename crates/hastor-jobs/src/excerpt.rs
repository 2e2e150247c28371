//! Log excerpts stored on terminated job records.

use std::io::ErrorKind;
use std::path::Path;

/// Lines kept from each end of the log.
pub const EXCERPT_LINES: usize = 10;

/// Placeholder used when the log file disappeared before the job finished.
pub const LOG_REMOVED: &str = "Log file was removed";

/// Head and tail of `text`. Logs of at most twice [`EXCERPT_LINES`] lines
/// are returned whole.
pub fn excerpt(text: &str) -> String {
    let lines: Vec<&str> = text.split_inclusive('\n').collect();
    if lines.len() <= 2 * EXCERPT_LINES {
        return text.to_string();
    }
    let skipped = lines.len() - 2 * EXCERPT_LINES;
    let mut out: String = lines[..EXCERPT_LINES].concat();
    if !out.ends_with('\n') {
        out.push('\n');
    }
    out.push_str(&format!("... {skipped} more lines ...\n"));
    out.push_str(&lines[lines.len() - EXCERPT_LINES..].concat());
    out
}

/// Excerpt of the log at `path`.
pub fn read_excerpt(path: &Path) -> String {
    match std::fs::read(path) {
        Ok(bytes) => excerpt(&String::from_utf8_lossy(&bytes)),
        Err(e) if e.kind() == ErrorKind::NotFound => LOG_REMOVED.to_string(),
        Err(e) => format!("Failed to read log file: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn numbered(n: usize) -> String {
        (1..=n).map(|i| format!("line {i}\n")).collect()
    }

    #[test]
    fn test_short_log_whole() {
        let text = numbered(20);
        assert_eq!(excerpt(&text), text);
    }

    #[test]
    fn test_long_log_head_and_tail() {
        let out = excerpt(&numbered(25));
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 21);
        assert_eq!(lines[0], "line 1");
        assert_eq!(lines[9], "line 10");
        assert_eq!(lines[10], "... 5 more lines ...");
        assert_eq!(lines[11], "line 16");
        assert_eq!(lines[20], "line 25");
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(read_excerpt(&dir.path().join("7.log")), LOG_REMOVED);
    }

    #[test]
    fn test_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("1.log");
        std::fs::write(&path, "hello\n").unwrap();
        assert_eq!(read_excerpt(&path), "hello\n");
    }
}
