//! Append-only side-effect logs.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;

use crate::error::Result;

/// Destination for newline-delimited side-effect entries.
#[async_trait]
pub trait SideEffectLog: Send + Sync {
    /// Append `lines`, one per line. No deduplication.
    async fn append_lines(&self, lines: &[String]) -> Result<()>;
}

/// Log backed by a file opened in append mode.
#[derive(Debug, Clone)]
pub struct FileLog {
    path: PathBuf,
}

impl FileLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl SideEffectLog for FileLog {
    async fn append_lines(&self, lines: &[String]) -> Result<()> {
        if lines.is_empty() {
            return Ok(());
        }

        let mut buffer = String::with_capacity(lines.iter().map(|l| l.len() + 1).sum());
        for line in lines {
            // Embedded newlines would split one entry across lines
            buffer.push_str(&line.replace(['\r', '\n'], " "));
            buffer.push('\n');
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(buffer.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

/// In-memory log, mostly for tests.
#[derive(Debug, Default)]
pub struct MemoryLog {
    lines: Mutex<Vec<String>>,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().clone()
    }
}

#[async_trait]
impl SideEffectLog for MemoryLog {
    async fn append_lines(&self, lines: &[String]) -> Result<()> {
        self.lines.lock().extend_from_slice(lines);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_file_log_appends_across_calls() {
        let dir = tempfile::tempdir().unwrap();
        let log = FileLog::new(dir.path().join("fonts.log"));

        log.append_lines(&["Lato".to_string(), "Inter".to_string()])
            .await
            .unwrap();
        log.append_lines(&["Lato".to_string()]).await.unwrap();
        log.append_lines(&[]).await.unwrap();

        let contents = tokio::fs::read_to_string(log.path()).await.unwrap();
        assert_eq!(contents, "Lato\nInter\nLato\n");
    }

    #[tokio::test]
    async fn test_file_log_keeps_one_entry_per_line() {
        let dir = tempfile::tempdir().unwrap();
        let log = FileLog::new(dir.path().join("mismatch.log"));

        log.append_lines(&["thumbs/a\nb.png".to_string()])
            .await
            .unwrap();

        let contents = tokio::fs::read_to_string(log.path()).await.unwrap();
        assert_eq!(contents, "thumbs/a b.png\n");
    }

    #[tokio::test]
    async fn test_file_log_missing_directory_errors() {
        let dir = tempfile::tempdir().unwrap();
        let log = FileLog::new(dir.path().join("absent").join("fonts.log"));
        assert!(log.append_lines(&["Lato".to_string()]).await.is_err());
    }
}
