// src/utils/progress.rs: append-only progress log for a pipeline run

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::{watch, Mutex};


/// Committed state of the log: `generation` increases on every reset,
/// `len` is the number of bytes written in the current generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LogMark {
    pub generation: u64,
    pub len: u64,
}


struct LogWriter {
    file: Option<File>,
    mark: LogMark,
}


/// The single record of what a run has done so far. One writer appends
/// whole lines; readers tail the file and are notified on every append.
#[derive(Clone)]
pub struct ProgressLog {
    path: PathBuf,
    writer: Arc<Mutex<LogWriter>>,
    marks: Arc<watch::Sender<LogMark>>,
}

impl ProgressLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let (marks, _) = watch::channel(LogMark::default());
        Self {
            path: path.into(),
            writer: Arc::new(Mutex::new(LogWriter { file: None, mark: LogMark::default() })),
            marks: Arc::new(marks),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn watch(&self) -> watch::Receiver<LogMark> {
        self.marks.subscribe()
    }

    pub fn mark(&self) -> LogMark {
        *self.marks.borrow()
    }

    /// Truncates (or creates) the log for a new run.
    pub async fn reset(&self) -> io::Result<()> {
        let mut writer = self.writer.lock().await;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)
            .await?;
        writer.file = Some(file);
        writer.mark = LogMark {
            generation: writer.mark.generation + 1,
            len: 0,
        };
        self.marks.send_replace(writer.mark);
        Ok(())
    }

    /// Appends one line; a terminating newline is added if missing.
    pub async fn append_line(&self, line: &str) -> io::Result<()> {
        let mut writer = self.writer.lock().await;
        if writer.file.is_none() {
            let file = OpenOptions::new().create(true).append(true).open(&self.path).await?;
            writer.mark.len = file.metadata().await?.len();
            writer.file = Some(file);
        }

        let mut record = line.trim_end_matches(['\n', '\r']).as_bytes().to_vec();
        record.push(b'\n');

        if let Some(file) = writer.file.as_mut() {
            file.write_all(&record).await?;
            file.flush().await?;
        }
        writer.mark.len += record.len() as u64;
        self.marks.send_replace(writer.mark);
        Ok(())
    }

    /// Current content of the log, empty if it does not exist yet.
    pub async fn read_to_string(&self) -> io::Result<String> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(String::from_utf8_lossy(&bytes).into_owned()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(e),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_append_and_reset() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let log = ProgressLog::new(dir.path().join("nested").join("progress.txt"));
        assert_eq!(log.read_to_string().await?, "");

        log.reset().await?;
        log.append_line("Pipeline started").await?;
        log.append_line("Step 0\n").await?;
        assert_eq!(log.read_to_string().await?, "Pipeline started\nStep 0\n");
        assert_eq!(log.mark(), LogMark { generation: 1, len: 24 });

        log.reset().await?;
        assert_eq!(log.read_to_string().await?, "");
        assert_eq!(log.mark(), LogMark { generation: 2, len: 0 });
        Ok(())
    }

    #[tokio::test]
    async fn test_append_without_reset_keeps_content() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("progress.txt");
        std::fs::write(&path, "earlier\n")?;

        let log = ProgressLog::new(&path);
        log.append_line("later").await?;
        assert_eq!(log.read_to_string().await?, "earlier\nlater\n");
        assert_eq!(log.mark().len, 14);
        Ok(())
    }

    #[tokio::test]
    async fn test_watch_sees_appends() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let log = ProgressLog::new(dir.path().join("progress.txt"));
        let mut rx = log.watch();
        log.reset().await?;
        rx.changed().await?;
        log.append_line("x").await?;
        rx.changed().await?;
        assert_eq!(rx.borrow_and_update().len, 2);
        Ok(())
    }
}
