//! Dual-partition log cache eviction (spec §4.11).

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::fs;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::config::LogCacheBudgets;

/// Background sweep cadence, absent an explicit signal (spec §4.11: "every
/// 10 minutes").
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(10 * 60);

struct PartitionFile {
    path: PathBuf,
    size: u64,
    /// Sort key: the `yyyy-mm-dd_HH-MM-SS` timestamp prefix embedded in the
    /// filename (spec §4.11: "evicts the oldest files by the timestamp
    /// prefix of the filename").
    timestamp_prefix: String,
}

/// Evicts oldest-first from `dir` until its total size is at or under
/// `budget_bytes`. Dot-prefixed (still-open) files are never touched.
async fn evict_partition(dir: &Path, budget_bytes: u64) -> std::io::Result<()> {
    if !dir.exists() {
        return Ok(());
    }

    let mut files = Vec::new();
    let mut entries = fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with('.') {
            continue; // still open, never evict
        }
        let metadata = entry.metadata().await?;
        if !metadata.is_file() {
            continue;
        }
        let timestamp_prefix = match name.match_indices('_').nth(1) {
            Some((idx, _)) => name[..idx].to_string(),
            None => name.clone(),
        };
        files.push(PartitionFile { path: entry.path(), size: metadata.len(), timestamp_prefix });
    }

    files.sort_by(|a, b| a.timestamp_prefix.cmp(&b.timestamp_prefix));

    let mut total: u64 = files.iter().map(|f| f.size).sum();
    for file in files {
        if total <= budget_bytes {
            break;
        }
        match fs::remove_file(&file.path).await {
            Ok(()) => {
                total = total.saturating_sub(file.size);
                debug!(path = %file.path.display(), "evicted log file over cache budget");
            }
            Err(err) => warn!(?err, path = %file.path.display(), "failed to evict log file"),
        }
    }
    Ok(())
}

/// Runs one eviction pass over both partitions.
pub async fn sweep_once(root: &Path, budgets: LogCacheBudgets) {
    let realtime_dir = root.join("lidar_log").join("type_0");
    let exception_dir = root.join("lidar_log").join("type_1");

    if let Err(err) = evict_partition(&realtime_dir, budgets.realtime_bytes).await {
        warn!(?err, "real-time log cache eviction failed");
    }
    if let Err(err) = evict_partition(&exception_dir, budgets.exception_bytes).await {
        warn!(?err, "exception log cache eviction failed");
    }
}

/// Spawns the background eviction loop: wakes on the fixed interval or
/// whenever `signal` is notified (an end-file event, per spec §4.11).
#[must_use]
pub fn spawn_eviction_loop(root: PathBuf, budgets: LogCacheBudgets, signal: Arc<Notify>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        info!(?budgets, "log cache eviction loop started");
        loop {
            tokio::select! {
                () = tokio::time::sleep(SWEEP_INTERVAL) => {}
                () = signal.notified() => {}
            }
            sweep_once(&root, budgets).await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs as stdfs;

    fn write_file(dir: &Path, name: &str, size: usize) {
        stdfs::create_dir_all(dir).unwrap();
        stdfs::write(dir.join(name), vec![0u8; size]).unwrap();
    }

    #[tokio::test]
    async fn evicts_oldest_first_until_under_budget() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("type_0");
        write_file(&dir, "2024-01-01_00-00-00_SN_0_0.dat", 100);
        write_file(&dir, "2024-01-02_00-00-00_SN_0_0.dat", 100);
        write_file(&dir, "2024-01-03_00-00-00_SN_0_0.dat", 100);

        evict_partition(&dir, 150).await.unwrap();

        let mut remaining: Vec<String> = Vec::new();
        let mut entries = fs::read_dir(&dir).await.unwrap();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            remaining.push(entry.file_name().to_string_lossy().to_string());
        }
        assert_eq!(remaining.len(), 1);
        assert!(remaining[0].starts_with("2024-01-03"));
    }

    #[tokio::test]
    async fn dot_prefixed_open_files_are_never_evicted() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("type_1");
        write_file(&dir, ".2024-01-01_00-00-00_SN_1_0.dat", 1000);

        evict_partition(&dir, 0).await.unwrap();

        let mut entries = fs::read_dir(&dir).await.unwrap();
        assert!(entries.next_entry().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn under_budget_partition_is_untouched() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("type_0");
        write_file(&dir, "2024-01-01_00-00-00_SN_0_0.dat", 10);

        evict_partition(&dir, 1000).await.unwrap();

        let mut entries = fs::read_dir(&dir).await.unwrap();
        assert!(entries.next_entry().await.unwrap().is_some());
    }
}
