//! Local ring log: daily operational breadcrumb files under
//! `kioskops_logs/`, pruned by the retention janitor. This is what a field
//! tech pulls with `export_local_files`: short one-liners (init, sync
//! summaries, retention counts), never payloads.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::warn;

use crate::clock::Clock;

pub struct RingLog {
    dir: PathBuf,
    clock: Arc<dyn Clock>,
}

impl RingLog {
    pub fn new(dir: PathBuf, clock: Arc<dyn Clock>) -> Self {
        Self { dir, clock }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Appends one line to today's file. Best-effort; a full disk must not
    /// take the pipeline down with it.
    pub async fn append(&self, line: &str) {
        let ts_ms = self.clock.now_ms();
        let path = self.dir.join(file_name(ts_ms));
        let entry = format!("{ts_ms} {line}\n");
        let write = async {
            let mut file = OpenOptions::new().create(true).append(true).open(&path).await?;
            file.write_all(entry.as_bytes()).await
        };
        if let Err(e) = write.await {
            warn!("ring log append failed: {e}");
        }
    }

    pub async fn files(&self) -> std::io::Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        let mut dir = match fs::read_dir(&self.dir).await {
            Ok(dir) => dir,
            Err(_) => return Ok(files),
        };
        while let Some(item) = dir.next_entry().await? {
            let name = item.file_name().to_string_lossy().to_string();
            if name.starts_with("ops_") && name.ends_with(".log") {
                files.push(item.path());
            }
        }
        files.sort();
        Ok(files)
    }

    /// Removes day-files whose day started at or before the cutoff.
    pub async fn purge_older_than(&self, cutoff_ms: i64) -> std::io::Result<u32> {
        let mut purged = 0;
        for path in self.files().await? {
            let name = path.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default();
            let Some(day_start) = day_start_ms(&name) else { continue };
            if day_start <= cutoff_ms {
                fs::remove_file(&path).await?;
                purged += 1;
            }
        }
        Ok(purged)
    }
}

fn file_name(ts_ms: i64) -> String {
    let day = chrono::DateTime::from_timestamp_millis(ts_ms)
        .map(|dt| dt.format("%Y-%m-%d").to_string())
        .unwrap_or_else(|| "1970-01-01".to_string());
    format!("ops_{day}.log")
}

fn day_start_ms(file_name: &str) -> Option<i64> {
    let day = file_name.strip_prefix("ops_")?.strip_suffix(".log")?;
    let date = chrono::NaiveDate::parse_from_str(day, "%Y-%m-%d").ok()?;
    Some(date.and_hms_opt(0, 0, 0)?.and_utc().timestamp_millis())
}
