//! C10 Log Tailer (spec §4.10). The DNS-answer decoding half of C10 lives in
//! [`wirewarden_kernel::dns`]; this module is the file-following half shared
//! by every log source that feeds it.

pub mod docker;

use std::os::unix::fs::MetadataExt;
use std::path::PathBuf;
use std::time::Duration;

use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, BufReader, SeekFrom};
use tokio::sync::Notify;
use tracing::{debug, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Follows an append-only log file, calling `on_line` for each new line.
/// Starts at the current end of the file (no backlog replay). Reopens the
/// file when it shrinks or its inode changes, handling truncation and log
/// rotation transparently (spec §4.10).
pub struct Tailer {
    path: PathBuf,
}

impl Tailer {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Runs until `cancel` is notified. Never returns an error: I/O failures
    /// are logged and retried after [`POLL_INTERVAL`].
    pub async fn start<F>(&self, cancel: &Notify, mut on_line: F)
    where
        F: FnMut(String) + Send,
    {
        let mut state = match self.open_at_end().await {
            Ok(state) => state,
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "failed to open log file for tailing");
                return;
            }
        };

        loop {
            tokio::select! {
                _ = cancel.notified() => break,
                line = read_line(&mut state.reader) => {
                    match line {
                        Ok(Some(text)) => {
                            state.offset += text.len() as u64 + 1;
                            on_line(text);
                        }
                        Ok(None) => {
                            if self.needs_reopen(&state).await {
                                match self.open_at_end().await {
                                    Ok(fresh) => {
                                        debug!(path = %self.path.display(), "log file rotated or truncated, reopened");
                                        state = fresh;
                                    }
                                    Err(err) => {
                                        warn!(path = %self.path.display(), error = %err, "failed to reopen rotated log file");
                                    }
                                }
                            }
                            tokio::select! {
                                _ = tokio::time::sleep(POLL_INTERVAL) => {}
                                _ = cancel.notified() => break,
                            }
                        }
                        Err(err) => {
                            warn!(path = %self.path.display(), error = %err, "error reading log file");
                            tokio::time::sleep(POLL_INTERVAL).await;
                        }
                    }
                }
            }
        }
    }

    async fn open_at_end(&self) -> std::io::Result<TailState> {
        let mut file = File::open(&self.path).await?;
        let metadata = file.metadata().await?;
        let offset = metadata.len();
        file.seek(SeekFrom::Start(offset)).await?;
        Ok(TailState { reader: BufReader::new(file), offset, inode: metadata.ino() })
    }

    async fn needs_reopen(&self, state: &TailState) -> bool {
        match tokio::fs::metadata(&self.path).await {
            Ok(metadata) => metadata.ino() != state.inode || metadata.len() < state.offset,
            Err(_) => true,
        }
    }
}

struct TailState {
    reader: BufReader<File>,
    offset: u64,
    inode: u64,
}

async fn read_line(reader: &mut BufReader<File>) -> std::io::Result<Option<String>> {
    let mut buf = String::new();
    let n = reader.read_line(&mut buf).await?;
    if n == 0 || !buf.ends_with('\n') {
        return Ok(None);
    }
    buf.pop();
    if buf.ends_with('\r') {
        buf.pop();
    }
    Ok(Some(buf))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::{Arc, Mutex};
    use tokio::time::timeout;

    #[tokio::test]
    async fn tails_appended_lines_and_stops_on_backlog() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.log");
        std::fs::write(&path, "old line\n").unwrap();

        let tailer = Tailer::new(path.clone());
        let cancel = Arc::new(Notify::new());
        let seen = Arc::new(Mutex::new(Vec::new()));

        let seen_clone = seen.clone();
        let cancel_clone = cancel.clone();
        let handle = tokio::spawn(async move {
            tailer
                .start(&cancel_clone, |line| seen_clone.lock().unwrap().push(line))
                .await;
        });

        // give the tailer a moment to open and seek to EOF
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(f, "new line").unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        cancel.notify_one();
        let _ = timeout(Duration::from_secs(1), handle).await;

        let lines = seen.lock().unwrap().clone();
        assert_eq!(lines, vec!["new line".to_string()]);
    }
}
