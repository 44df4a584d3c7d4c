use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use super::Checkpointer;

/// Stores one token per partition at `<base>/<job>/<partition>.json` and its
/// row log next to it as `<partition>.rows.jsonl`. Token writes go to a
/// `.tmp` sibling first and are renamed into place, so a crash mid-write
/// leaves the previous checkpoint intact. Holds no state of its own; workers
/// on different partitions touch different files.
#[derive(Debug, Clone)]
pub struct FileCheckpointer {
    base: PathBuf,
}

impl FileCheckpointer {
    pub fn new(base: impl AsRef<Path>) -> Self { Self { base: base.as_ref().to_path_buf() } }

    fn sanitize(part: &str) -> String {
        part.chars().map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' { c } else { '_' }).collect()
    }

    fn job_dir(&self, job: &str) -> PathBuf { self.base.join(Self::sanitize(job)) }

    fn path_for(&self, job: &str, partition: &str) -> PathBuf {
        self.job_dir(job).join(format!("{}.json", Self::sanitize(partition)))
    }

    fn rows_path(&self, job: &str, partition: &str) -> PathBuf {
        self.job_dir(job).join(format!("{}.rows.jsonl", Self::sanitize(partition)))
    }

    fn ensure_job_dir(&self, job: &str) -> Result<()> {
        let dir = self.job_dir(job);
        fs::create_dir_all(&dir).with_context(|| format!("Failed to create checkpoint dir {}", dir.display()))
    }

    fn write_replacing(path: &Path, contents: &str) -> Result<()> {
        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        fs::write(&tmp, contents).with_context(|| format!("Failed writing checkpoint temp {}", tmp.display()))?;
        fs::rename(&tmp, path).with_context(|| format!("Failed replacing checkpoint {}", path.display()))
    }
}

impl Checkpointer for FileCheckpointer {
    fn save(&self, job: &str, partition: &str, token: &str) -> Result<()> {
        self.ensure_job_dir(job)?;
        Self::write_replacing(&self.path_for(job, partition), token)
    }

    fn load(&self, job: &str, partition: &str) -> Result<Option<String>> {
        let path = self.path_for(job, partition);
        match fs::read_to_string(&path) {
            Ok(s) => Ok(Some(s)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed reading checkpoint {}", path.display())),
        }
    }

    fn append_rows(&self, job: &str, partition: &str, lines: &str) -> Result<()> {
        self.ensure_job_dir(job)?;
        let path = self.rows_path(job, partition);
        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed opening row log {}", path.display()))?;
        f.write_all(lines.as_bytes()).with_context(|| format!("Failed appending to row log {}", path.display()))?;
        f.sync_data().with_context(|| format!("Failed syncing row log {}", path.display()))
    }

    fn load_rows(&self, job: &str, partition: &str) -> Result<Vec<String>> {
        let path = self.rows_path(job, partition);
        // Lossy: a torn final record may end inside a multi-byte character.
        match fs::read(&path) {
            Ok(bytes) => Ok(String::from_utf8_lossy(&bytes).lines().map(str::to_string).collect()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e).with_context(|| format!("Failed reading row log {}", path.display())),
        }
    }

    fn reset_rows(&self, job: &str, partition: &str, lines: &str) -> Result<()> {
        self.ensure_job_dir(job)?;
        Self::write_replacing(&self.rows_path(job, partition), lines)
    }

    fn clear(&self, job: &str) -> Result<()> {
        let dir = self.job_dir(job);
        match fs::remove_dir_all(&dir) {
            Ok(()) => { log::info!("[Checkpoint] Cleared {}", dir.display()); Ok(()) }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed clearing checkpoints in {}", dir.display())),
        }
    }
}
