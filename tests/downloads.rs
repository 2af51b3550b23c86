mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use periodicals_sync::{
    DownloadError, DownloadRegistry, Downloader, FailureKind, FileStore, FileType, LocalStore,
    ProgressEntry, ProgressLedger,
};
use tempfile::TempDir;

use common::{watch_until, MemorySource};

fn downloader(dir: &TempDir, source: MemorySource, concurrency: usize) -> Downloader {
    let files = FileStore::new(dir.path(), Some("reader"));
    Downloader::new(Arc::new(source), files, ProgressLedger::new(), concurrency)
}

fn loading_values(entries: &[Option<ProgressEntry>]) -> Vec<(u64, u64)> {
    entries
        .iter()
        .filter_map(|entry| match entry {
            Some(ProgressEntry::Loading { current, total }) => Some((*current, *total)),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn completed_download_reports_monotonic_progress() {
    let dir = TempDir::new().unwrap();
    let downloader = downloader(&dir, MemorySource::new().with_file(42, 1_000_000), 8);
    let mut subscription = downloader.ledger().subscribe();

    let marked = Arc::new(AtomicBool::new(false));
    let flag = marked.clone();
    let handle = downloader
        .download(42, "PUB/", FileType::Pdf, move || async move {
            flag.store(true, Ordering::SeqCst);
        })
        .unwrap();
    let path = handle.wait().await.unwrap();

    let mut entries = Vec::new();
    while let Some(snapshot) = subscription.next().await {
        let entry = snapshot.get(&42).copied();
        entries.push(entry);
        if entry == Some(ProgressEntry::Success) {
            break;
        }
    }

    let loading = loading_values(&entries);
    assert!(loading.len() > 2, "expected several progress updates");
    assert_eq!(loading[0], (0, 0));
    assert!(loading.windows(2).all(|w| w[0].0 <= w[1].0));
    assert_eq!(loading.last().unwrap().0, 1_000_000);
    assert!(loading[1..].iter().all(|&(_, total)| total == 1_000_000));
    assert_eq!(entries.last().unwrap(), &Some(ProgressEntry::Success));

    assert!(marked.load(Ordering::SeqCst));
    assert_eq!(path, downloader.file_for_reading(42, "PUB"));
    assert_eq!(std::fs::metadata(&path).unwrap().len(), 1_000_000);
    assert!(downloader.are_all_loadings_complete());
}

#[tokio::test]
async fn progress_is_published_per_chunk() {
    let dir = TempDir::new().unwrap();
    let size = periodicals_sync::CHUNK_SIZE * 3 + 10;
    let downloader = downloader(&dir, MemorySource::new().with_file(5, size), 8);
    let mut subscription = downloader.ledger().subscribe();

    downloader
        .download(5, "p/", FileType::Pdf, || async {})
        .unwrap()
        .wait()
        .await
        .unwrap();

    let mut entries = Vec::new();
    while let Some(snapshot) = subscription.next().await {
        let entry = snapshot.get(&5).copied();
        entries.push(entry);
        if entry == Some(ProgressEntry::Success) {
            break;
        }
    }
    let chunk = periodicals_sync::CHUNK_SIZE as u64;
    let currents: Vec<u64> = loading_values(&entries).iter().map(|&(c, _)| c).collect();
    assert_eq!(currents, vec![0, chunk, chunk * 2, chunk * 3, size as u64]);
}

#[tokio::test]
async fn cancelled_download_leaves_no_file() {
    let dir = TempDir::new().unwrap();
    let downloader = downloader(&dir, MemorySource::new().with_stalled_file(7, 40_000), 8);

    let handle = downloader
        .download(7, "PUB/", FileType::Pdf, || async {})
        .unwrap();
    watch_until(downloader.ledger(), 7, |entry| {
        matches!(entry, Some(ProgressEntry::Loading { current, .. }) if current > 0)
    })
    .await;
    let path = downloader.file_for_reading(7, "PUB");
    assert!(path.exists(), "partial file should exist while streaming");

    downloader.cancel_download(7);
    let err = handle.wait().await.unwrap_err();

    assert!(matches!(err, DownloadError::Cancelled));
    assert!(!path.exists());
    assert_eq!(
        downloader.ledger().get(7),
        Some(ProgressEntry::Error(FailureKind::Cancelled))
    );
    assert!(downloader.are_all_loadings_complete());
}

#[tokio::test]
async fn cancelling_unknown_download_is_a_no_op() {
    let dir = TempDir::new().unwrap();
    let downloader = downloader(&dir, MemorySource::new(), 8);
    downloader.cancel_download(1);
    assert!(downloader.are_all_loadings_complete());
    assert!(downloader.ledger().snapshot().is_empty());
}

#[tokio::test]
async fn failed_request_writes_nothing() {
    let dir = TempDir::new().unwrap();
    let downloader = downloader(&dir, MemorySource::new(), 8);

    let called = Arc::new(AtomicBool::new(false));
    let flag = called.clone();
    let err = downloader
        .download(3, "PUB/", FileType::Pdf, move || async move {
            flag.store(true, Ordering::SeqCst);
        })
        .unwrap()
        .wait()
        .await
        .unwrap_err();

    assert_eq!(err.kind(), FailureKind::RequestFailed);
    assert_eq!(FailureKind::RequestFailed.tag(), "request failed");
    assert!(!called.load(Ordering::SeqCst));
    assert!(!downloader.file_for_reading(3, "PUB").exists());
    assert_eq!(
        downloader.ledger().get(3),
        Some(ProgressEntry::Error(FailureKind::RequestFailed))
    );
    assert!(downloader.are_all_loadings_complete());
}

#[tokio::test]
async fn broken_body_reports_io_failure_and_removes_partial_file() {
    let dir = TempDir::new().unwrap();
    let downloader = downloader(&dir, MemorySource::new().with_broken_file(13, 40_000), 8);

    let err = downloader
        .download(13, "PUB/", FileType::Pdf, || async {})
        .unwrap()
        .wait()
        .await
        .unwrap_err();

    assert_eq!(err.kind(), FailureKind::Io);
    assert!(!downloader.file_for_reading(13, "PUB").exists());
    assert_eq!(
        downloader.ledger().get(13),
        Some(ProgressEntry::Error(FailureKind::Io))
    );
    assert!(downloader.are_all_loadings_complete());
}

#[tokio::test]
async fn unusable_output_directory_reports_generic_failure() {
    let dir = TempDir::new().unwrap();
    let downloader = downloader(&dir, MemorySource::new().with_file(14, 1_000), 8);

    // A regular file occupies the publication directory.
    let root = downloader.files().root().to_path_buf();
    std::fs::create_dir_all(&root).unwrap();
    std::fs::write(root.join("PUB"), b"").unwrap();

    let err = downloader
        .download(14, "PUB/", FileType::Pdf, || async {})
        .unwrap()
        .wait()
        .await
        .unwrap_err();

    assert_eq!(err.kind(), FailureKind::Other);
    assert_eq!(
        downloader.ledger().get(14),
        Some(ProgressEntry::Error(FailureKind::Other))
    );
    assert!(downloader.are_all_loadings_complete());
}

#[tokio::test]
async fn deleted_file_disappears_from_ledger() {
    let dir = TempDir::new().unwrap();
    let downloader = downloader(&dir, MemorySource::new().with_file(11, 50_000), 8);
    downloader
        .download(11, "PUB/", FileType::Pdf, || async {})
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert_eq!(downloader.ledger().get(11), Some(ProgressEntry::Success));

    let cleaned = Arc::new(AtomicBool::new(false));
    let flag = cleaned.clone();
    let deleted = downloader
        .delete_file(11, "PUB/", FileType::Pdf, move || async move {
            flag.store(true, Ordering::SeqCst);
        })
        .await;

    assert!(deleted);
    assert!(cleaned.load(Ordering::SeqCst));
    assert_eq!(downloader.ledger().get(11), None);
    assert!(!downloader.file_for_reading(11, "PUB").exists());

    let mut subscription = downloader.ledger().subscribe();
    let path = downloader
        .download(11, "PUB/", FileType::Pdf, || async {})
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert_eq!(std::fs::metadata(path).unwrap().len(), 50_000);

    // Skip replayed history up to the removal, then expect a fresh start.
    let mut after_removal = Vec::new();
    let mut removed = false;
    while let Some(snapshot) = subscription.next().await {
        let entry = snapshot.get(&11).copied();
        if !removed {
            removed = entry.is_none();
            continue;
        }
        after_removal.push(entry);
        if entry == Some(ProgressEntry::Success) {
            break;
        }
    }
    assert_eq!(
        after_removal.first(),
        Some(&Some(ProgressEntry::Loading { current: 0, total: 0 }))
    );
}

#[tokio::test]
async fn deletion_failure_reports_false() {
    let dir = TempDir::new().unwrap();
    let downloader = downloader(&dir, MemorySource::new(), 8);

    // A directory where the file should be cannot be removed as a file.
    let path = downloader.file_for_reading(12, "PUB");
    std::fs::create_dir_all(&path).unwrap();

    let cleaned = Arc::new(AtomicBool::new(false));
    let flag = cleaned.clone();
    let deleted = downloader
        .delete_file(12, "PUB/", FileType::Pdf, move || async move {
            flag.store(true, Ordering::SeqCst);
        })
        .await;
    assert!(!deleted);
    assert!(!cleaned.load(Ordering::SeqCst));
}

#[tokio::test]
async fn concurrent_downloads_track_bytes_per_file() {
    let dir = TempDir::new().unwrap();
    let source = MemorySource::new()
        .with_file(1, 500_000)
        .with_file(2, 500_000);
    let downloader = downloader(&dir, source, 8);
    let mut subscription = downloader.ledger().subscribe();

    let first = downloader.download(1, "A/", FileType::Pdf, || async {}).unwrap();
    let second = downloader.download(2, "A/", FileType::Pdf, || async {}).unwrap();
    let (a, b) = tokio::join!(first.wait(), second.wait());
    let (a, b) = (a.unwrap(), b.unwrap());

    let mut per_file: [Vec<u64>; 2] = [Vec::new(), Vec::new()];
    while let Some(snapshot) = subscription.next().await {
        for (slot, id) in [1i64, 2].iter().enumerate() {
            if let Some(ProgressEntry::Loading { current, .. }) = snapshot.get(id) {
                if per_file[slot].last() != Some(current) {
                    per_file[slot].push(*current);
                }
            }
        }
        if snapshot.get(&1) == Some(&ProgressEntry::Success)
            && snapshot.get(&2) == Some(&ProgressEntry::Success)
        {
            break;
        }
    }

    for values in &per_file {
        assert!(values.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(values.last(), Some(&500_000));
    }
    assert_eq!(std::fs::metadata(a).unwrap().len(), 500_000);
    assert_eq!(std::fs::metadata(b).unwrap().len(), 500_000);
}

#[tokio::test]
async fn duplicate_submission_is_ignored_while_active() {
    let dir = TempDir::new().unwrap();
    let source = MemorySource::new().with_stalled_file(9, 20_000);
    let downloader = downloader(&dir, source, 8);

    let handle = downloader.download(9, "P/", FileType::Pdf, || async {}).unwrap();
    assert!(downloader.download(9, "P/", FileType::Pdf, || async {}).is_none());
    assert!(!downloader.are_all_loadings_complete());

    downloader.cancel_download(9);
    assert!(handle.wait().await.is_err());
    assert!(downloader.are_all_loadings_complete());
}

#[tokio::test]
async fn concurrency_bound_queues_extra_downloads() {
    let dir = TempDir::new().unwrap();
    let source = MemorySource::new()
        .with_stalled_file(1, 20_000)
        .with_file(2, 10_000);
    let source = Arc::new(source);
    let files = FileStore::new(dir.path(), None);
    let downloader = Downloader::new(source.clone(), files, ProgressLedger::new(), 1);

    let first = downloader.download(1, "P/", FileType::Pdf, || async {}).unwrap();
    watch_until(downloader.ledger(), 1, |entry| {
        matches!(entry, Some(ProgressEntry::Loading { current, .. }) if current > 0)
    })
    .await;
    let second = downloader.download(2, "P/", FileType::Pdf, || async {}).unwrap();

    tokio::task::yield_now().await;
    assert_eq!(source.fetches.load(Ordering::SeqCst), 1);
    assert_eq!(
        downloader.ledger().get(2),
        Some(ProgressEntry::Loading { current: 0, total: 0 })
    );

    downloader.cancel_download(1);
    assert!(first.wait().await.is_err());
    second.wait().await.unwrap();
    assert_eq!(source.fetches.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn ledger_is_seeded_from_downloaded_editions() {
    let store = LocalStore::in_memory();
    store.mark_downloaded(4, "PUB").await.unwrap();
    store.mark_downloaded(8, "PUB").await.unwrap();

    let downloaded = store.downloaded_editions().await.unwrap();
    let ledger = ProgressLedger::with_completed(downloaded.iter().map(|e| e.edition_id));

    assert_eq!(ledger.get(4), Some(ProgressEntry::Success));
    assert_eq!(ledger.get(8), Some(ProgressEntry::Success));
    assert_eq!(ledger.snapshot().len(), 2);
}
