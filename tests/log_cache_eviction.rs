//! Log cache eviction against a real filesystem, with no networking at all
//! — safe to run fully in parallel with every other test in the suite.

use std::path::Path;

use lidar_runtime::config::LogCacheBudgets;
use lidar_runtime::logger::cache::sweep_once;

fn write_file(dir: &Path, name: &str, size: usize) {
    std::fs::create_dir_all(dir).unwrap();
    std::fs::write(dir.join(name), vec![0u8; size]).unwrap();
}

#[tokio::test]
async fn sweep_once_evicts_both_partitions_independently() {
    let tmp = tempfile::tempdir().unwrap();
    let realtime_dir = tmp.path().join("lidar_log").join("type_0");
    let exception_dir = tmp.path().join("lidar_log").join("type_1");

    write_file(&realtime_dir, "2024-01-01_00-00-00_SN_0_0.dat", 100);
    write_file(&realtime_dir, "2024-01-02_00-00-00_SN_0_0.dat", 100);
    write_file(&exception_dir, "2024-01-01_00-00-00_SN_1_0.dat", 50);

    let budgets = LogCacheBudgets { realtime_bytes: 150, exception_bytes: 1000 };
    sweep_once(tmp.path(), budgets).await;

    let mut remaining = Vec::new();
    let mut entries = tokio::fs::read_dir(&realtime_dir).await.unwrap();
    while let Some(entry) = entries.next_entry().await.unwrap() {
        remaining.push(entry.file_name().to_string_lossy().to_string());
    }
    assert_eq!(remaining.len(), 1, "oldest file over budget should have been evicted");
    assert!(remaining[0].starts_with("2024-01-02"));

    let mut exception_entries = tokio::fs::read_dir(&exception_dir).await.unwrap();
    assert!(
        exception_entries.next_entry().await.unwrap().is_some(),
        "under-budget partition must be left untouched"
    );
}

#[tokio::test]
async fn sweep_once_tolerates_missing_partition_directories() {
    let tmp = tempfile::tempdir().unwrap();
    let budgets = LogCacheBudgets { realtime_bytes: 10, exception_bytes: 10 };
    sweep_once(tmp.path(), budgets).await; // must not error or panic
}

#[tokio::test]
async fn dot_prefixed_file_survives_a_zero_budget_sweep() {
    let tmp = tempfile::tempdir().unwrap();
    let exception_dir = tmp.path().join("lidar_log").join("type_1");
    write_file(&exception_dir, ".2024-01-01_00-00-00_SN_1_0.dat", 5000);

    let budgets = LogCacheBudgets { realtime_bytes: 0, exception_bytes: 0 };
    sweep_once(tmp.path(), budgets).await;

    let mut entries = tokio::fs::read_dir(&exception_dir).await.unwrap();
    assert!(entries.next_entry().await.unwrap().is_some(), "open (dot-prefixed) file must never be evicted");
}
