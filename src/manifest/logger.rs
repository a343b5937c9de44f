//! Single-writer manifest logger.
//!
//! One dedicated thread owns the manifest file handle. Every other component holds a
//! cloneable `ManifestHandle` and sends entries to the writer over a channel; each
//! append is acknowledged only after the line has been written.

use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::thread::JoinHandle;
use tokio::sync::{mpsc, oneshot};

use super::ManifestEntry;
use crate::errors::WorkflowError;

/// Writer options.
#[derive(Debug, Clone, Copy, Default)]
pub struct ManifestOptions {
    /// Call `sync_data` after every line
    pub fsync: bool,
}

enum Command {
    Append {
        entry: Box<ManifestEntry>,
        ack: oneshot::Sender<std::io::Result<()>>,
    },
    Shutdown {
        ack: oneshot::Sender<()>,
    },
}

/// Cloneable sender side of the manifest writer.
#[derive(Clone)]
pub struct ManifestHandle {
    path: PathBuf,
    tx: mpsc::UnboundedSender<Command>,
}

impl ManifestHandle {
    /// Append one entry and wait until it is on disk (or the write failed).
    pub async fn append(&self, entry: ManifestEntry) -> Result<(), WorkflowError> {
        let (ack, done) = oneshot::channel();
        self.tx
            .send(Command::Append {
                entry: Box::new(entry),
                ack,
            })
            .map_err(|_| self.writer_gone())?;

        match done.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(source)) => Err(WorkflowError::ManifestWrite {
                path: self.path.clone(),
                source,
            }),
            Err(_) => Err(self.writer_gone()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn writer_gone(&self) -> WorkflowError {
        WorkflowError::ManifestWrite {
            path: self.path.clone(),
            source: std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "manifest writer has stopped",
            ),
        }
    }
}

/// Owner of the writer thread.
pub struct ManifestLogger {
    handle: ManifestHandle,
    thread: Option<JoinHandle<()>>,
}

impl ManifestLogger {
    /// Open (or create) the manifest and start the writer thread.
    ///
    /// The file is locked exclusively for the lifetime of the writer. If an earlier
    /// process died mid-append, the torn tail is terminated with a newline so new
    /// entries start on a fresh line.
    pub fn open(path: &Path, options: ManifestOptions) -> Result<Self, WorkflowError> {
        let io_err = |source: std::io::Error| WorkflowError::ManifestWrite {
            path: path.to_path_buf(),
            source,
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(path)
            .map_err(io_err)?;

        file.try_lock_exclusive().map_err(|e| {
            io_err(std::io::Error::new(
                e.kind(),
                format!("manifest is locked by another run: {e}"),
            ))
        })?;

        repair_torn_tail(&mut file).map_err(io_err)?;

        let (tx, rx) = mpsc::unbounded_channel();
        let thread = std::thread::Builder::new()
            .name("manifest-writer".to_string())
            .spawn(move || writer_loop(file, rx, options))
            .map_err(io_err)?;

        tracing::debug!(manifest = %path.display(), "Manifest writer started");

        Ok(Self {
            handle: ManifestHandle {
                path: path.to_path_buf(),
                tx,
            },
            thread: Some(thread),
        })
    }

    pub fn handle(&self) -> ManifestHandle {
        self.handle.clone()
    }

    pub fn path(&self) -> &Path {
        self.handle.path()
    }

    /// Stop the writer after every queued entry has been written, and release the lock.
    pub async fn close(mut self) {
        let (ack, done) = oneshot::channel();
        if self.handle.tx.send(Command::Shutdown { ack }).is_ok() {
            done.await.ok();
        }
        if let Some(thread) = self.thread.take() {
            tokio::task::spawn_blocking(move || thread.join()).await.ok();
        }
    }
}

fn repair_torn_tail(file: &mut File) -> std::io::Result<()> {
    let len = file.metadata()?.len();
    if len == 0 {
        return Ok(());
    }
    file.seek(SeekFrom::Start(len - 1))?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last)?;
    if last[0] != b'\n' {
        tracing::warn!("Manifest ended with a partial line; terminating it before appending");
        file.write_all(b"\n")?;
    }
    Ok(())
}

fn writer_loop(mut file: File, mut rx: mpsc::UnboundedReceiver<Command>, options: ManifestOptions) {
    while let Some(command) = rx.blocking_recv() {
        match command {
            Command::Append { entry, ack } => {
                let result = write_line(&mut file, &entry, options.fsync);
                if let Err(ref e) = result {
                    tracing::error!(phase = %entry.phase, error = %e, "Manifest append failed");
                }
                ack.send(result).ok();
            }
            Command::Shutdown { ack } => {
                file.flush().ok();
                ack.send(()).ok();
                break;
            }
        }
    }
    FileExt::unlock(&file).ok();
}

fn write_line(file: &mut File, entry: &ManifestEntry, fsync: bool) -> std::io::Result<()> {
    let mut line = serde_json::to_vec(entry)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    line.push(b'\n');
    // One buffer per line: a crash can tear only the line being written.
    file.write_all(&line)?;
    if fsync {
        file.sync_data()?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{ManifestStatus, replay};
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_append_writes_parseable_lines() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("run/manifest.jsonl");
        let logger = ManifestLogger::open(&path, ManifestOptions::default()).unwrap();
        let handle = logger.handle();

        handle.append(ManifestEntry::started("a", 1, 0)).await.unwrap();
        handle
            .append(ManifestEntry::skipped("b", 0, "dependency skipped"))
            .await
            .unwrap();
        logger.close().await;

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 2);
        assert!(content.ends_with('\n'));
        let replay = replay(&path).unwrap();
        assert_eq!(replay.latest("b").unwrap().status, ManifestStatus::Skipped);
    }

    #[tokio::test]
    async fn test_concurrent_appends_never_interleave() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("manifest.jsonl");
        let logger = ManifestLogger::open(&path, ManifestOptions { fsync: false }).unwrap();

        let mut tasks = Vec::new();
        for i in 0..64 {
            let handle = logger.handle();
            tasks.push(tokio::spawn(async move {
                let reason = "x".repeat(2000 + i);
                handle
                    .append(ManifestEntry::skipped(&format!("p{i}"), 0, &reason))
                    .await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        logger.close().await;

        let content = std::fs::read_to_string(&path).unwrap();
        let mut count = 0;
        for line in content.lines() {
            let entry: ManifestEntry = serde_json::from_str(line).expect("every line parses");
            assert!(entry.phase.starts_with('p'));
            count += 1;
        }
        assert_eq!(count, 64);
    }

    #[tokio::test]
    async fn test_reopen_appends_after_torn_line() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("manifest.jsonl");
        let good = ManifestEntry::started("a", 1, 0).to_line().unwrap();
        std::fs::write(&path, format!("{good}\n{{\"phase\":\"a\",\"st")).unwrap();

        let logger = ManifestLogger::open(&path, ManifestOptions::default()).unwrap();
        logger
            .handle()
            .append(ManifestEntry::skipped("a", 0, "resumed"))
            .await
            .unwrap();
        logger.close().await;

        let replay = replay(&path).unwrap();
        assert_eq!(replay.entries.len(), 2);
        assert_eq!(replay.skipped_lines, 1);
        assert_eq!(replay.latest("a").unwrap().status, ManifestStatus::Skipped);
    }

    #[tokio::test]
    async fn test_append_after_close_is_a_manifest_write_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("manifest.jsonl");
        let logger = ManifestLogger::open(&path, ManifestOptions::default()).unwrap();
        let handle = logger.handle();
        logger.close().await;

        let err = handle
            .append(ManifestEntry::started("late", 1, 0))
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::ManifestWrite { .. }));
    }

    #[tokio::test]
    async fn test_second_writer_on_same_manifest_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("manifest.jsonl");
        let first = ManifestLogger::open(&path, ManifestOptions::default()).unwrap();
        let second = ManifestLogger::open(&path, ManifestOptions::default());
        assert!(matches!(second, Err(WorkflowError::ManifestWrite { .. })));
        first.close().await;
    }
}
