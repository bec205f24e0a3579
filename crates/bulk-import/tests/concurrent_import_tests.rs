//! Integration tests for the worker-pool importer.

mod common;

use bulk_import::{
    ConcurrentImporter, DirectoryImporter, ImportError, ImporterConfig, MapBasedMetadataLoader,
    MemoryRepository, ProcessingState, StoredContent, SyncImporter,
};
use common::{tree, write_file, PanickingLoader, WrappedRepository};
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tempfile::TempDir;

fn fast_config() -> ImporterConfig {
    ImporterConfig::default()
        .with_worker_threads(2, 4)
        .with_completion_check_interval(Duration::from_millis(10))
}

fn concurrent_importer(repo: &Arc<MemoryRepository>) -> ConcurrentImporter {
    ConcurrentImporter::new(
        DirectoryImporter::new(repo.clone())
            .with_metadata_loader(MapBasedMetadataLoader::json())
            .with_config(fast_config()),
    )
}

/// A tree several levels deep and a few directories wide.
fn build_source(root: &Path) {
    write_file(root, "top.txt", b"top");
    for i in 0..4 {
        for j in 0..3 {
            write_file(root, &format!("d{i}/e{j}/leaf.txt"), b"leaf");
            write_file(root, &format!("d{i}/e{j}/leaf.txt.v1"), b"old");
        }
        write_file(root, &format!("d{i}/note.txt"), b"note");
        write_file(root, &format!("d{i}/note.txt.metadata.json"), br#"{"author": "ops"}"#);
    }
}

#[test]
fn test_concurrent_import_matches_sync_import() {
    let temp_dir = TempDir::new().unwrap();
    build_source(temp_dir.path());

    let concurrent_repo = Arc::new(MemoryRepository::new());
    let importer = concurrent_importer(&concurrent_repo);
    importer
        .bulk_import(&concurrent_repo.root(), temp_dir.path(), false)
        .unwrap();
    assert_eq!(importer.join(), ProcessingState::Succeeded);

    let sync_repo = Arc::new(MemoryRepository::new());
    SyncImporter::new(
        DirectoryImporter::new(sync_repo.clone())
            .with_metadata_loader(MapBasedMetadataLoader::json()),
    )
    .bulk_import(&sync_repo.root(), temp_dir.path(), false)
    .unwrap();

    let paths = tree(&concurrent_repo, &concurrent_repo.root());
    assert_eq!(paths, tree(&sync_repo, &sync_repo.root()));
    assert_eq!(paths.len(), 1 + 4 * (1 + 1 + 3 * 2));

    let status = importer.status();
    assert_eq!(status.folders_scanned(), 1 + 4 + 12);
    assert_eq!(status.space_nodes_created(), 16);
    assert_eq!(status.content_nodes_created(), 1 + 4 + 12);
    assert_eq!(status.content_versions_created(), 12);
    assert_eq!(status.metadata_files_read(), 4);
    assert!(!status.in_progress());

    let leaf = concurrent_repo.resolve("d2/e1/leaf.txt").unwrap();
    assert_eq!(concurrent_repo.revisions(&leaf).len(), 1);
    assert_eq!(
        concurrent_repo.content(&leaf),
        Some(StoredContent::Bytes(b"leaf".to_vec()))
    );
}

#[test]
fn test_batches_counted_across_workers() {
    let temp_dir = TempDir::new().unwrap();
    for i in 0..250 {
        write_file(temp_dir.path(), &format!("file-{i:03}.txt"), b"x");
    }
    let repo = Arc::new(MemoryRepository::new());
    let importer = concurrent_importer(&repo);

    importer.bulk_import(&repo.root(), temp_dir.path(), false).unwrap();

    assert_eq!(importer.join(), ProcessingState::Succeeded);
    assert_eq!(importer.status().batches_completed(), 3);
    assert_eq!(importer.status().content_nodes_created(), 250);
}

#[test]
fn test_join_without_import() {
    let repo = Arc::new(MemoryRepository::new());
    let importer = concurrent_importer(&repo);
    assert_eq!(importer.join(), ProcessingState::NotRunning);
    assert!(matches!(importer.stop_import(), Err(ImportError::NotRunning)));
}

fn slow_importer(repo: &Arc<MemoryRepository>, delay: Duration) -> ConcurrentImporter {
    ConcurrentImporter::new(
        DirectoryImporter::new(Arc::new(WrappedRepository::slow(repo.clone(), delay)))
            .with_config(fast_config().with_worker_threads(1, 1)),
    )
}

#[test]
fn test_second_start_while_running_fails() {
    let temp_dir = TempDir::new().unwrap();
    write_file(temp_dir.path(), "a.txt", b"alpha");
    let other = TempDir::new().unwrap();
    let repo = Arc::new(MemoryRepository::new());
    let importer = slow_importer(&repo, Duration::from_millis(300));

    importer.bulk_import(&repo.root(), temp_dir.path(), false).unwrap();
    let err = importer
        .bulk_import(&repo.root(), other.path(), false)
        .unwrap_err();

    assert!(matches!(err, ImportError::AlreadyRunning));
    assert_eq!(importer.status().state(), ProcessingState::Running);
    assert_eq!(
        importer.status().source_directory(),
        Some(temp_dir.path().canonicalize().unwrap())
    );

    assert_eq!(importer.join(), ProcessingState::Succeeded);
    assert_eq!(importer.status().content_nodes_created(), 1);
}

#[test]
fn test_stop_drains_pool_and_ends_stopped() {
    let temp_dir = TempDir::new().unwrap();
    for i in 0..20 {
        write_file(temp_dir.path(), &format!("dir-{i:02}/file.txt"), b"x");
    }
    let repo = Arc::new(MemoryRepository::new());
    let importer = slow_importer(&repo, Duration::from_millis(200));

    importer.bulk_import(&repo.root(), temp_dir.path(), false).unwrap();
    thread::sleep(Duration::from_millis(50));
    importer.stop_import().unwrap();
    assert!(matches!(
        importer.status().state(),
        ProcessingState::Stopping | ProcessingState::Stopped
    ));
    assert!(matches!(importer.stop_import(), Err(ImportError::NotRunning)));

    assert_eq!(importer.join(), ProcessingState::Stopped);
    let status = importer.status();
    assert!(status.last_error().is_none());
    assert!(status.end_date().is_some());
    assert_eq!(status.content_nodes_created(), 0);
}

#[test]
fn test_restart_after_stop() {
    let temp_dir = TempDir::new().unwrap();
    for i in 0..5 {
        write_file(temp_dir.path(), &format!("dir-{i}/file.txt"), b"x");
    }
    let repo = Arc::new(MemoryRepository::new());
    let importer = slow_importer(&repo, Duration::from_millis(100));

    importer.bulk_import(&repo.root(), temp_dir.path(), false).unwrap();
    thread::sleep(Duration::from_millis(20));
    importer.stop_import().unwrap();
    assert_eq!(importer.join(), ProcessingState::Stopped);

    importer.bulk_import(&repo.root(), temp_dir.path(), false).unwrap();
    assert_eq!(importer.join(), ProcessingState::Succeeded);
    assert_eq!(importer.status().space_nodes_skipped(), 5);
    assert_eq!(importer.status().content_nodes_created(), 5);
}

#[test]
fn test_failure_in_subdirectory_fails_import() {
    let temp_dir = TempDir::new().unwrap();
    build_source(temp_dir.path());
    write_file(temp_dir.path(), "d3/e2/bad.txt", b"bad");
    write_file(temp_dir.path(), "d3/e2/bad.txt.metadata.json", b"[broken");
    let repo = Arc::new(MemoryRepository::new());
    let importer = concurrent_importer(&repo);

    importer.bulk_import(&repo.root(), temp_dir.path(), false).unwrap();

    assert_eq!(importer.join(), ProcessingState::Failed);
    let status = importer.status();
    let message = status.last_error().unwrap();
    assert!(message.contains("bad.txt.metadata.json"), "{message}");
    assert!(!status.in_progress());
}

#[test]
fn test_validation_error_leaves_status_idle() {
    let temp_dir = TempDir::new().unwrap();
    let repo = Arc::new(MemoryRepository::new());
    let importer = concurrent_importer(&repo);

    let err = importer
        .bulk_import(&repo.root(), &temp_dir.path().join("missing"), false)
        .unwrap_err();

    assert!(matches!(err, ImportError::SourceNotFound(_)));
    assert_eq!(importer.status().state(), ProcessingState::NotRunning);
    assert_eq!(importer.join(), ProcessingState::NotRunning);
}

#[test]
fn test_panic_in_worker_fails_import() {
    let temp_dir = TempDir::new().unwrap();
    build_source(temp_dir.path());
    write_file(temp_dir.path(), "sub/a.txt", b"nested");
    write_file(temp_dir.path(), "sub/a.txt.metadata.json", b"{}");
    let repo = Arc::new(MemoryRepository::new());
    let importer = ConcurrentImporter::new(
        DirectoryImporter::new(repo.clone())
            .with_metadata_loader(PanickingLoader)
            .with_config(fast_config()),
    );

    importer.bulk_import(&repo.root(), temp_dir.path(), false).unwrap();

    assert_eq!(importer.join(), ProcessingState::Failed);
    let status = importer.status();
    assert!(status.last_error().is_some_and(|e| e.contains("loader blew up")));
    assert!(status.end_date().is_some());
}
