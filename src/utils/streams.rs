// src/utils/streams.rs: child output streams and the progress log tail

use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Result};
use log::{debug, warn};
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncSeekExt, BufReader};
use tokio::process::Child;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_stream::wrappers::ReceiverStream;

use crate::utils::progress::{LogMark, ProgressLog};


pub const WAITING_MESSAGE: &str = "Waiting for progress file to be created...";
const SUBSCRIBER_BUFFER: usize = 64;


#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ChildStream {
    Stdout,
    Stderr,
}


/// Reads all of a child's stdout or stderr into lines.
///
/// # Arguments
///
/// * `child` - Spawned child with piped output.
/// * `stream` - Which output to read.
///
/// # Returns
/// Vec of lines, without terminators.
pub async fn read_child_output_to_vec(child: &mut Child, stream: ChildStream) -> Result<Vec<String>> {
    let mut lines = Vec::new();
    match stream {
        ChildStream::Stdout => {
            let stdout = child.stdout.take().ok_or_else(|| anyhow!("Child stdout not captured"))?;
            let mut reader = BufReader::new(stdout).lines();
            while let Some(line) = reader.next_line().await? {
                lines.push(line);
            }
        }
        ChildStream::Stderr => {
            let stderr = child.stderr.take().ok_or_else(|| anyhow!("Child stderr not captured"))?;
            let mut reader = BufReader::new(stderr).lines();
            while let Some(line) = reader.next_line().await? {
                lines.push(line);
            }
        }
    }
    Ok(lines)
}


/// Forwards each line of `reader` to `tx` as it arrives. Invalid UTF-8 is
/// replaced rather than ending the stream, since tool output is arbitrary.
///
/// # Arguments
///
/// * `reader` - Child stdout or stderr.
/// * `tx` - Destination for lines, terminators stripped.
///
/// # Returns
/// Handle of the reader task; it finishes at EOF or when `tx` closes.
pub fn spawn_line_reader<R>(reader: R, tx: mpsc::Sender<String>) -> JoinHandle<io::Result<()>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            let n = reader.read_until(b'\n', &mut buf).await?;
            if n == 0 {
                break;
            }
            let line = String::from_utf8_lossy(&buf);
            let line = line.trim_end_matches(['\n', '\r']).to_string();
            if tx.send(line).await.is_err() {
                break;
            }
        }
        Ok(())
    })
}


/// One event pushed to a progress subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    /// No progress log exists yet.
    Waiting,
    /// Newly appended, non-blank log lines joined with `\n`.
    Lines(String),
}

impl ProgressEvent {
    pub fn text(&self) -> &str {
        match self {
            ProgressEvent::Waiting => WAITING_MESSAGE,
            ProgressEvent::Lines(lines) => lines,
        }
    }

    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.text().split('\n')
    }

    /// Server-sent event framing, one `data:` field per line.
    pub fn to_sse(&self) -> String {
        let mut frame = String::new();
        for line in self.lines() {
            frame.push_str("data: ");
            frame.push_str(line);
            frame.push('\n');
        }
        frame.push('\n');
        frame
    }
}


/// Read position of one subscriber in the progress log.
#[derive(Debug, Default)]
struct LogCursor {
    offset: u64,
    partial: Vec<u8>,
    generation: u64,
    waiting_sent: bool,
}

impl LogCursor {
    fn new(generation: u64) -> Self {
        Self {
            generation,
            ..Self::default()
        }
    }

    fn restart(&mut self) {
        self.offset = 0;
        self.partial.clear();
    }

    /// Reads everything appended since the last call and returns the event
    /// for its complete lines, if any.
    async fn poll(&mut self, path: &Path, generation: Option<u64>) -> io::Result<Option<ProgressEvent>> {
        if let Some(generation) = generation {
            if generation != self.generation {
                self.generation = generation;
                self.restart();
            }
        }

        let mut file = match File::open(path).await {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                self.restart();
                if self.waiting_sent {
                    return Ok(None);
                }
                self.waiting_sent = true;
                return Ok(Some(ProgressEvent::Waiting));
            }
            Err(e) => return Err(e),
        };
        self.waiting_sent = false;

        let len = file.metadata().await?.len();
        if len < self.offset {
            self.restart();
        }
        if len == self.offset {
            return Ok(None);
        }

        file.seek(SeekFrom::Start(self.offset)).await?;
        let mut delta = Vec::with_capacity((len - self.offset) as usize);
        file.take(len - self.offset).read_to_end(&mut delta).await?;
        self.offset += delta.len() as u64;

        Ok(self.consume(&delta))
    }

    /// Drops `event` if the log was reset after `poll` took its generation,
    /// since the bytes read may belong to either run. The next poll rereads
    /// the new log from offset 0.
    fn settle(&mut self, event: ProgressEvent, generation_now: Option<u64>) -> Option<ProgressEvent> {
        match generation_now {
            Some(generation) if generation != self.generation => {
                debug!("Progress log reset during read; rereading from the start");
                self.restart();
                None
            }
            _ => Some(event),
        }
    }

    /// Keeps a trailing partial line buffered; emits complete, non-blank lines.
    fn consume(&mut self, bytes: &[u8]) -> Option<ProgressEvent> {
        self.partial.extend_from_slice(bytes);
        let last_newline = self.partial.iter().rposition(|&b| b == b'\n')?;
        let complete: Vec<u8> = self.partial.drain(..=last_newline).collect();

        let text = String::from_utf8_lossy(&complete);
        let lines = text
            .split('\n')
            .map(|l| l.trim_end_matches('\r'))
            .filter(|l| !l.trim().is_empty())
            .collect::<Vec<_>>()
            .join("\n");

        if lines.is_empty() {
            None
        } else {
            Some(ProgressEvent::Lines(lines))
        }
    }
}


/// Serves a progress log to any number of independent subscribers.
#[derive(Clone)]
pub struct ProgressStreamer {
    path: PathBuf,
    marks: watch::Receiver<LogMark>,
    poll_interval: Duration,
}

impl ProgressStreamer {
    /// Tails `log`, woken by its append notifications and by the poll tick.
    pub fn new(log: &ProgressLog, poll_interval: Duration) -> Self {
        Self {
            path: log.path().to_path_buf(),
            marks: log.watch(),
            poll_interval,
        }
    }

    /// Starts a subscriber at offset 0. Dropping the returned stream ends the
    /// subscriber's task and closes its file handle.
    pub fn subscribe(&self) -> ReceiverStream<ProgressEvent> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        let path = self.path.clone();
        let marks = self.marks.clone();
        let poll_interval = self.poll_interval;
        tokio::spawn(async move {
            tail_log(path, Some(marks), poll_interval, tx).await;
        });
        ReceiverStream::new(rx)
    }
}


async fn tail_log(
    path: PathBuf,
    mut marks: Option<watch::Receiver<LogMark>>,
    poll_interval: Duration,
    tx: mpsc::Sender<ProgressEvent>,
) {
    let start_generation = marks.as_ref().map(|m| m.borrow().generation).unwrap_or(0);
    let mut cursor = LogCursor::new(start_generation);
    let mut ticker = interval(poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let generation = marks.as_mut().map(|m| m.borrow_and_update().generation);
        match cursor.poll(&path, generation).await {
            Ok(Some(event)) => {
                let generation_now = marks.as_ref().map(|m| m.borrow().generation);
                match cursor.settle(event, generation_now) {
                    Some(event) => {
                        if tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    None => continue,
                }
            }
            Ok(None) => {}
            Err(e) => warn!("Error reading progress file {}: {}", path.display(), e),
        }

        tokio::select! {
            _ = ticker.tick() => {}
            changed = wait_for_mark(&mut marks) => {
                if changed.is_err() {
                    // Log handle dropped; keep tailing on the tick alone.
                    marks = None;
                }
            }
            _ = tx.closed() => break,
        }
    }

    debug!("Progress subscriber for {} disconnected", path.display());
}


async fn wait_for_mark(marks: &mut Option<watch::Receiver<LogMark>>) -> Result<(), watch::error::RecvError> {
    match marks {
        Some(rx) => rx.changed().await,
        None => std::future::pending().await,
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use tempfile::tempdir;
    use tokio::time::timeout;

    const POLL: Duration = Duration::from_millis(50);

    #[test]
    fn test_cursor_buffers_partial_line() {
        let mut cursor = LogCursor::new(0);
        assert_eq!(cursor.consume(b"Step 1"), None);
        assert_eq!(cursor.consume(b".1: QC\nStep 1.2"), Some(ProgressEvent::Lines("Step 1.1: QC".to_string())));
        assert_eq!(cursor.consume(b": Trim\n"), Some(ProgressEvent::Lines("Step 1.2: Trim".to_string())));
    }

    #[test]
    fn test_cursor_drops_blank_lines() {
        let mut cursor = LogCursor::new(0);
        assert_eq!(
            cursor.consume(b"a\n\n   \r\nb\r\n"),
            Some(ProgressEvent::Lines("a\nb".to_string()))
        );
        assert_eq!(cursor.consume(b"\n\n"), None);
    }

    #[tokio::test]
    async fn test_cursor_discards_read_spanning_reset() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("progress.txt");
        std::fs::write(&path, "old run line\n")?;

        let mut cursor = LogCursor::new(1);
        let event = cursor.poll(&path, Some(1)).await?;
        assert_eq!(event, Some(ProgressEvent::Lines("old run line".to_string())));
        // Reset to generation 2 landed while the bytes above were being read.
        std::fs::write(&path, "new\n")?;
        let event = event.and_then(|e| cursor.settle(e, Some(2)));
        assert_eq!(event, None);

        assert_eq!(cursor.poll(&path, Some(2)).await?, Some(ProgressEvent::Lines("new".to_string())));
        Ok(())
    }

    #[test]
    fn test_settle_keeps_event_of_current_generation() {
        let mut cursor = LogCursor::new(3);
        let event = ProgressEvent::Lines("a".to_string());
        assert_eq!(cursor.settle(event.clone(), Some(3)), Some(event.clone()));
        assert_eq!(cursor.settle(event.clone(), None), Some(event));
    }

    #[test]
    fn test_sse_framing() {
        assert_eq!(ProgressEvent::Lines("a\nb".to_string()).to_sse(), "data: a\ndata: b\n\n");
        assert_eq!(ProgressEvent::Waiting.to_sse(), format!("data: {}\n\n", WAITING_MESSAGE));
    }

    #[tokio::test]
    async fn test_waiting_then_lines() -> Result<()> {
        let dir = tempdir()?;
        let log = ProgressLog::new(dir.path().join("progress.txt"));
        let streamer = ProgressStreamer::new(&log, POLL);
        let mut events = streamer.subscribe();

        assert_eq!(timeout(Duration::from_secs(2), events.next()).await?, Some(ProgressEvent::Waiting));
        // Only one placeholder while the log is absent.
        assert!(timeout(POLL * 4, events.next()).await.is_err());

        log.reset().await?;
        log.append_line("Pipeline started").await?;
        assert_eq!(
            timeout(Duration::from_secs(2), events.next()).await?,
            Some(ProgressEvent::Lines("Pipeline started".to_string()))
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_late_subscriber_gets_full_replay() -> Result<()> {
        let dir = tempdir()?;
        let log = ProgressLog::new(dir.path().join("progress.txt"));
        log.reset().await?;
        log.append_line("one").await?;
        log.append_line("two").await?;

        let streamer = ProgressStreamer::new(&log, POLL);
        let mut early = streamer.subscribe();
        assert_eq!(timeout(Duration::from_secs(2), early.next()).await?, Some(ProgressEvent::Lines("one\ntwo".to_string())));

        log.append_line("three").await?;
        let mut late = streamer.subscribe();
        assert_eq!(
            timeout(Duration::from_secs(2), late.next()).await?,
            Some(ProgressEvent::Lines("one\ntwo\nthree".to_string()))
        );
        assert_eq!(timeout(Duration::from_secs(2), early.next()).await?, Some(ProgressEvent::Lines("three".to_string())));
        Ok(())
    }

    #[tokio::test]
    async fn test_no_events_without_growth() -> Result<()> {
        let dir = tempdir()?;
        let log = ProgressLog::new(dir.path().join("progress.txt"));
        log.reset().await?;
        log.append_line("only line").await?;

        let mut events = ProgressStreamer::new(&log, POLL).subscribe();
        assert!(timeout(Duration::from_secs(2), events.next()).await?.is_some());
        assert!(timeout(POLL * 5, events.next()).await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_reset_restarts_subscribers() -> Result<()> {
        let dir = tempdir()?;
        let log = ProgressLog::new(dir.path().join("progress.txt"));
        log.reset().await?;
        log.append_line("first run, a long line to outgrow the next run").await?;

        let mut events = ProgressStreamer::new(&log, POLL).subscribe();
        assert!(timeout(Duration::from_secs(2), events.next()).await?.is_some());

        log.reset().await?;
        log.append_line("second run").await?;
        assert_eq!(
            timeout(Duration::from_secs(2), events.next()).await?,
            Some(ProgressEvent::Lines("second run".to_string()))
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_tick_sees_writes_outside_the_log() -> Result<()> {
        let dir = tempdir()?;
        let log = ProgressLog::new(dir.path().join("progress.txt"));
        let path = log.path().to_path_buf();
        std::fs::write(&path, "external\npartial")?;

        let mut events = ProgressStreamer::new(&log, POLL).subscribe();
        assert_eq!(timeout(Duration::from_secs(2), events.next()).await?, Some(ProgressEvent::Lines("external".to_string())));

        let mut file = std::fs::OpenOptions::new().append(true).open(&path)?;
        std::io::Write::write_all(&mut file, b" line\n")?;
        assert_eq!(
            timeout(Duration::from_secs(2), events.next()).await?,
            Some(ProgressEvent::Lines("partial line".to_string()))
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_dropped_subscriber_does_not_affect_others() -> Result<()> {
        let dir = tempdir()?;
        let log = ProgressLog::new(dir.path().join("progress.txt"));
        log.reset().await?;

        let streamer = ProgressStreamer::new(&log, POLL);
        let gone = streamer.subscribe();
        let mut kept = streamer.subscribe();
        drop(gone);

        log.append_line("still here").await?;
        assert_eq!(
            timeout(Duration::from_secs(2), kept.next()).await?,
            Some(ProgressEvent::Lines("still here".to_string()))
        );
        Ok(())
    }
}
