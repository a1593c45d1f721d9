//! JSON-lines block log: one serialized block per line, append-only.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;

use super::block::Block;
use crate::error::{ChatSealError, Result};

/// Outcome of reading the log at startup.
#[derive(Debug)]
pub(crate) enum LogContents {
    Missing,
    Blocks(Vec<Block>),
    /// Present but not parseable; carries the reason.
    Unreadable(String),
}

#[derive(Debug, Clone)]
pub(crate) struct ChainLog {
    path: PathBuf,
}

impl ChainLog {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read every block. IO errors other than "not found" are returned;
    /// malformed lines are reported as [`LogContents::Unreadable`].
    pub fn read(&self) -> Result<LogContents> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(LogContents::Missing),
            Err(e) => return Err(e.into()),
        };
        let reader = BufReader::new(file);
        let mut blocks = Vec::new();
        for (number, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Block>(&line) {
                Ok(block) => blocks.push(block),
                Err(e) => {
                    return Ok(LogContents::Unreadable(format!(
                        "line {}: {}",
                        number + 1,
                        e
                    )))
                }
            }
        }
        if blocks.is_empty() {
            return Ok(LogContents::Missing);
        }
        Ok(LogContents::Blocks(blocks))
    }

    pub fn append(&self, block: &Block) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let line = serde_json::to_string(block)?;
        writeln!(file, "{}", line)?;
        file.flush()?;
        Ok(())
    }

    /// Replace the whole log atomically.
    pub fn rewrite(&self, blocks: &[Block]) -> Result<()> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&dir)?;
        let mut tmp = NamedTempFile::new_in(&dir)?;
        for block in blocks {
            let line = serde_json::to_string(block)?;
            writeln!(tmp, "{}", line)?;
        }
        tmp.flush()?;
        tmp.persist(&self.path)
            .map_err(|e| ChatSealError::Persistence(format!("{}: {}", self.path.display(), e.error)))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_and_empty_logs() {
        let dir = tempdir().unwrap();
        let log = ChainLog::new(dir.path().join("ledger.jsonl"));
        assert!(matches!(log.read().unwrap(), LogContents::Missing));
        fs::write(log.path(), "\n\n").unwrap();
        assert!(matches!(log.read().unwrap(), LogContents::Missing));
    }

    #[test]
    fn append_then_read() {
        let dir = tempdir().unwrap();
        let log = ChainLog::new(dir.path().join("ledger.jsonl"));
        log.append(&Block::genesis()).unwrap();
        match log.read().unwrap() {
            LogContents::Blocks(blocks) => assert_eq!(blocks, vec![Block::genesis()]),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn garbage_line_is_unreadable() {
        let dir = tempdir().unwrap();
        let log = ChainLog::new(dir.path().join("ledger.jsonl"));
        log.append(&Block::genesis()).unwrap();
        let mut file = OpenOptions::new().append(true).open(log.path()).unwrap();
        writeln!(file, "{{not json").unwrap();
        match log.read().unwrap() {
            LogContents::Unreadable(reason) => assert!(reason.starts_with("line 2")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn rewrite_replaces_contents() {
        let dir = tempdir().unwrap();
        let log = ChainLog::new(dir.path().join("ledger.jsonl"));
        fs::write(log.path(), "junk\n").unwrap();
        log.rewrite(&[Block::genesis()]).unwrap();
        let text = fs::read_to_string(log.path()).unwrap();
        assert_eq!(text.lines().count(), 1);
        assert!(matches!(log.read().unwrap(), LogContents::Blocks(_)));
    }
}
