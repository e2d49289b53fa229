//! Task log blobs on the filesystem.
//!
//! Each task writes one file of JSON lines (`{"time":..,"content":..}`)
//! under `{repo_id % 256:02x}/{repo_id}/{task_id}.log`. When the runner
//! reports the last batch the file is finalized, which with zstd enabled
//! replaces it by `{task_id}.log.zst`.

use std::fs::{self, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::debug;

use crate::config::LogCompression;
use crate::models::LogRow;

const ZSTD_LEVEL: i32 = 3;

#[derive(Debug, Clone)]
pub struct LogStore {
    root: PathBuf,
    compression: LogCompression,
}

impl LogStore {
    pub fn new(root: impl Into<PathBuf>, compression: LogCompression) -> Self {
        Self {
            root: root.into(),
            compression,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn dir(&self, repo_id: i64) -> PathBuf {
        self.root
            .join(format!("{:02x}", repo_id.rem_euclid(256)))
            .join(repo_id.to_string())
    }

    pub fn raw_path(&self, repo_id: i64, task_id: i64) -> PathBuf {
        self.dir(repo_id).join(format!("{}.log", task_id))
    }

    pub fn compressed_path(&self, repo_id: i64, task_id: i64) -> PathBuf {
        self.dir(repo_id).join(format!("{}.log.zst", task_id))
    }

    /// Write `rows` after the first `offset` bytes of the raw file. Anything
    /// past `offset` (a batch that was written but never acknowledged) is
    /// dropped first. Returns the new file length.
    pub fn append(&self, repo_id: i64, task_id: i64, offset: i64, rows: &[LogRow]) -> Result<i64> {
        let path = self.raw_path(repo_id, task_id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create log directory: {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open log file: {}", path.display()))?;
        let offset = u64::try_from(offset).context("Negative log offset")?;
        if file.metadata().context("Failed to stat log file")?.len() != offset {
            file.set_len(offset).context("Failed to truncate log file")?;
        }

        let mut writer = BufWriter::new(&file);
        for row in rows {
            serde_json::to_writer(&mut writer, row).context("Failed to encode log row")?;
            writer.write_all(b"\n").context("Failed to write log row")?;
        }
        writer.flush().context("Failed to flush log file")?;
        drop(writer);

        let len = file.metadata().context("Failed to stat log file")?.len();
        Ok(len as i64)
    }

    /// Seal the log. Returns the size of what is now stored.
    pub fn finalize(&self, repo_id: i64, task_id: i64) -> Result<i64> {
        let raw_path = self.raw_path(repo_id, task_id);
        let raw = match fs::read(&raw_path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to read log file: {}", raw_path.display()));
            }
        };

        match self.compression {
            LogCompression::None => {
                if !raw_path.exists() {
                    self.append(repo_id, task_id, 0, &[])?;
                }
                Ok(raw.len() as i64)
            }
            LogCompression::Zstd => {
                let compressed =
                    zstd::bulk::compress(&raw, ZSTD_LEVEL).context("Failed to compress log")?;
                let path = self.compressed_path(repo_id, task_id);
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent).with_context(|| {
                        format!("Failed to create log directory: {}", parent.display())
                    })?;
                }
                fs::write(&path, &compressed)
                    .with_context(|| format!("Failed to write log file: {}", path.display()))?;
                remove_if_exists(&raw_path)?;
                debug!(task_id, raw = raw.len(), stored = compressed.len(), "Compressed task log");
                Ok(compressed.len() as i64)
            }
        }
    }

    /// Read every row of a task's log, finalized or not.
    pub fn read(&self, repo_id: i64, task_id: i64) -> Result<Vec<LogRow>> {
        let zst = self.compressed_path(repo_id, task_id);
        let bytes = if zst.exists() {
            let compressed = fs::read(&zst)
                .with_context(|| format!("Failed to read log file: {}", zst.display()))?;
            zstd::decode_all(compressed.as_slice()).context("Failed to decompress log")?
        } else {
            match fs::read(self.raw_path(repo_id, task_id)) {
                Ok(bytes) => bytes,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
                Err(e) => return Err(e).context("Failed to read log file"),
            }
        };

        let text = String::from_utf8(bytes).context("Log file is not UTF-8")?;
        text.lines()
            .filter(|l| !l.is_empty())
            .map(|l| serde_json::from_str(l).context("Failed to parse log row"))
            .collect()
    }

    pub fn remove(&self, repo_id: i64, task_id: i64) -> Result<()> {
        remove_if_exists(&self.raw_path(repo_id, task_id))?;
        remove_if_exists(&self.compressed_path(repo_id, task_id))
    }
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("Failed to remove {}", path.display())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn rows(lines: &[&str]) -> Vec<LogRow> {
        lines
            .iter()
            .map(|l| LogRow {
                time: Utc::now(),
                content: l.to_string(),
            })
            .collect()
    }

    #[test]
    fn test_layout() {
        let store = LogStore::new("/logs", LogCompression::Zstd);
        assert_eq!(
            store.raw_path(300, 7),
            PathBuf::from("/logs/2c/300/7.log")
        );
        assert_eq!(
            store.compressed_path(5, 9),
            PathBuf::from("/logs/05/5/9.log.zst")
        );
    }

    #[test]
    fn test_append_truncates_unacknowledged_tail() {
        let dir = tempfile::tempdir().unwrap();
        let store = LogStore::new(dir.path(), LogCompression::None);

        let len1 = store.append(1, 1, 0, &rows(&["one", "two"])).unwrap();
        let len2 = store.append(1, 1, len1, &rows(&["three"])).unwrap();
        assert!(len2 > len1);

        // Replay of the second batch from the acknowledged offset.
        let len3 = store.append(1, 1, len1, &rows(&["three"])).unwrap();
        assert_eq!(len2, len3);

        let read: Vec<String> = store.read(1, 1).unwrap().into_iter().map(|r| r.content).collect();
        assert_eq!(read, vec!["one", "two", "three"]);
    }

    #[test]
    fn test_finalize_with_zstd() {
        let dir = tempfile::tempdir().unwrap();
        let store = LogStore::new(dir.path(), LogCompression::Zstd);
        store.append(2, 8, 0, &rows(&["hello", "world"])).unwrap();

        let stored = store.finalize(2, 8).unwrap();
        assert!(stored > 0);
        assert!(!store.raw_path(2, 8).exists());
        assert!(store.compressed_path(2, 8).exists());

        let read: Vec<String> = store.read(2, 8).unwrap().into_iter().map(|r| r.content).collect();
        assert_eq!(read, vec!["hello", "world"]);

        store.remove(2, 8).unwrap();
        assert!(store.read(2, 8).unwrap().is_empty());
    }

    #[test]
    fn test_finalize_empty_log() {
        let dir = tempfile::tempdir().unwrap();
        let store = LogStore::new(dir.path(), LogCompression::Zstd);
        store.finalize(3, 1).unwrap();
        assert!(store.read(3, 1).unwrap().is_empty());
    }
}
