//! Reader for the keepalived notify FIFO.
//!
//! Lines are parsed and forwarded to an unbounded channel so the writer is
//! never blocked by event processing.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::net::unix::pipe;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::event::{parse_fifo_line, VrrpEvent};

const REOPEN_DELAY: Duration = Duration::from_secs(1);

/// Forward every event read from `reader` until EOF. Returns how many
/// events were forwarded. Malformed lines are logged and skipped.
pub async fn read_events<R>(mut reader: R, tx: &UnboundedSender<VrrpEvent>) -> std::io::Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    let mut forwarded = 0;
    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf).await? == 0 {
            break;
        }
        let line = match std::str::from_utf8(&buf) {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "ignoring VRRP FIFO line that is not UTF-8");
                continue;
            }
        };
        match parse_fifo_line(line) {
            Ok(Some(ev)) => {
                debug!(ifname = %ev.ifname, event = %ev.kind, "VRRP event received");
                if tx.send(ev).is_err() {
                    debug!("event consumer gone, stopping FIFO reader");
                    break;
                }
                forwarded += 1;
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "ignoring VRRP FIFO line"),
        }
    }
    Ok(forwarded)
}

/// FIFO reader task.
#[derive(Debug, Clone)]
pub struct FifoReader {
    path: PathBuf,
}

impl FifoReader {
    /// Reader for the FIFO at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// FIFO path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read until `token` is cancelled or the consumer goes away. The FIFO
    /// is opened read-write so it never reports EOF when the last writer
    /// closes; open failures are retried.
    pub async fn run(self, tx: UnboundedSender<VrrpEvent>, token: CancellationToken) {
        info!(path = %self.path.display(), "VRRP FIFO reader started");
        loop {
            let receiver = match pipe::OpenOptions::new().read_write(true).open_receiver(&self.path) {
                Ok(r) => r,
                Err(e) => {
                    warn!(path = %self.path.display(), error = %e, "failed to open VRRP FIFO");
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = tokio::time::sleep(REOPEN_DELAY) => continue,
                    }
                }
            };
            tokio::select! {
                _ = token.cancelled() => break,
                res = read_events(BufReader::new(receiver), &tx) => match res {
                    Ok(n) => debug!(events = n, "VRRP FIFO closed"),
                    Err(e) => warn!(error = %e, "VRRP FIFO read failed"),
                },
            }
            if tx.is_closed() {
                break;
            }
        }
        info!("VRRP FIFO reader stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventKind;
    use std::io::Write;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_read_events_skips_bad_lines() {
        let input: &[u8] = b"INSTANCE eth0_1 MASTER 254\ngarbage\n\nINSTANCE eth1_2 BACKUP 100\n";
        let (tx, mut rx) = mpsc::unbounded_channel();
        assert_eq!(read_events(input, &tx).await.unwrap(), 2);
        assert_eq!(rx.recv().await.unwrap().ifname, "eth0");
        assert_eq!(rx.recv().await.unwrap().kind, EventKind::Backup);
    }

    #[tokio::test]
    async fn test_read_events_survives_invalid_utf8() {
        let input: &[u8] = b"\xffbad\nINSTANCE eth0_1 MASTER 254\n";
        let (tx, mut rx) = mpsc::unbounded_channel();
        assert_eq!(read_events(input, &tx).await.unwrap(), 1);
        let ev = rx.try_recv().unwrap();
        assert_eq!(ev.ifname, "eth0");
        assert_eq!(ev.kind, EventKind::Master);
    }

    #[tokio::test]
    async fn test_reads_from_fifo() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vrrp_fifo");
        let cpath = std::ffi::CString::new(path.to_str().unwrap()).unwrap();
        assert_eq!(unsafe { libc::mkfifo(cpath.as_ptr(), 0o600) }, 0);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let token = CancellationToken::new();
        let reader = tokio::spawn(FifoReader::new(&path).run(tx, token.clone()));

        // Wait for the reader end so the write-only open does not fail.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let writer_path = path.clone();
        tokio::task::spawn_blocking(move || {
            let mut f = std::fs::OpenOptions::new().write(true).open(writer_path).unwrap();
            f.write_all(b"INSTANCE \"eth0_10\" MASTER 254\n").unwrap();
        })
        .await
        .unwrap();

        let ev = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
        assert_eq!(ev.ifname, "eth0");
        assert_eq!(ev.vhid, Some(10));

        token.cancel();
        reader.await.unwrap();
    }
}
