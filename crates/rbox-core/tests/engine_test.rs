mod common;

use common::{test_config, FakeBackend};
use rbox_core::{
    Artifact, Engine, ExecutionResult, FailureKind, FileFilter, FileKind, ImageFormat,
    ImageParams, PackageError, SessionId, WorkspaceError,
};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

fn engine_with(backend: Arc<FakeBackend>) -> (Engine, tempfile::TempDir) {
    let (config, scratch) = test_config();
    let engine = Engine::with_backend(config, backend).unwrap();
    (engine, scratch)
}

#[tokio::test]
async fn test_text_run_returns_printed_value() {
    let backend = Arc::new(FakeBackend::default());
    let (engine, _scratch) = engine_with(backend.clone());
    let session = SessionId::new("text");

    let request = engine.text_request(&session, "1+1", None).unwrap();
    match engine.execute(&request).await {
        ExecutionResult::Success(Artifact::Text { output }) => assert_eq!(output, "[1] 2\n"),
        other => panic!("unexpected result: {:?}", other),
    }
    engine.shutdown().await;
}

#[tokio::test]
async fn test_text_run_without_output_is_empty_success() {
    let backend = Arc::new(FakeBackend::default());
    let (engine, _scratch) = engine_with(backend);
    let session = SessionId::new("quiet");

    let request = engine.text_request(&session, "x <- 1", None).unwrap();
    match engine.execute(&request).await {
        ExecutionResult::Success(Artifact::Text { output }) => assert!(output.is_empty()),
        other => panic!("unexpected result: {:?}", other),
    }
}

#[tokio::test]
async fn test_caller_error_is_classified() {
    let backend = Arc::new(FakeBackend::default());
    let (engine, _scratch) = engine_with(backend);
    let session = SessionId::new("errors");

    let request = engine
        .text_request(&session, "stop(\"boom\")", None)
        .unwrap();
    let result = engine.execute(&request).await;
    assert_eq!(result.failure_kind(), Some(FailureKind::CallerError));
    match result {
        ExecutionResult::Failure(failure) => assert!(failure.message.contains("boom")),
        other => panic!("unexpected result: {:?}", other),
    }
}

#[tokio::test]
async fn test_environment_reused_within_session() {
    let backend = Arc::new(FakeBackend::default());
    let (engine, _scratch) = engine_with(backend.clone());
    let session = SessionId::new("reuse");

    for _ in 0..3 {
        let request = engine.text_request(&session, "1+1", None).unwrap();
        assert!(engine.execute(&request).await.is_success());
    }

    let executed = backend.executed_in();
    assert_eq!(executed.len(), 3);
    assert!(executed.iter().all(|id| id == &executed[0]));
    assert_eq!(backend.provisioned().len(), 1);
}

#[tokio::test]
async fn test_sessions_do_not_share_environments() {
    let backend = Arc::new(FakeBackend::default());
    let (engine, _scratch) = engine_with(backend.clone());

    for name in ["alpha", "beta"] {
        let request = engine
            .text_request(&SessionId::new(name), "1+1", None)
            .unwrap();
        assert!(engine.execute(&request).await.is_success());
    }

    let executed = backend.executed_in();
    assert_eq!(executed.len(), 2);
    assert_ne!(executed[0], executed[1]);
}

#[tokio::test]
async fn test_timeout_destroys_environment() {
    let backend = Arc::new(FakeBackend::default());
    let (engine, _scratch) = engine_with(backend.clone());
    let session = SessionId::new("slow");

    let request = engine
        .text_request(&session, "Sys.sleep(60)", Some(Duration::from_secs(1)))
        .unwrap();
    let started = std::time::Instant::now();
    let result = engine.execute(&request).await;
    assert_eq!(result.failure_kind(), Some(FailureKind::Timeout));
    assert!(started.elapsed() < Duration::from_secs(10));

    let timed_out = backend.executed_in()[0].clone();
    assert!(backend.destroyed().contains(&timed_out));

    // the next run gets a fresh environment
    let request = engine.text_request(&session, "1+1", None).unwrap();
    assert!(engine.execute(&request).await.is_success());
    let executed = backend.executed_in();
    assert_ne!(executed[1], timed_out);
}

#[tokio::test]
async fn test_image_run_renders_requested_size() {
    let backend = Arc::new(FakeBackend::with_packages(&[
        ("ggplot2", "3.5.1"),
        ("cowplot", "1.1.3"),
    ]));
    let (engine, _scratch) = engine_with(backend.clone());
    let session = SessionId::new("plots");

    let params = ImageParams::new(ImageFormat::Png, 800, 600, 150).unwrap();
    let request = engine
        .image_request(&session, "plot(1:10)", Some(params), None)
        .unwrap();
    match engine.execute(&request).await {
        ExecutionResult::Success(Artifact::Image {
            format,
            mime_type,
            width,
            height,
            bytes,
            ..
        }) => {
            assert_eq!(format, ImageFormat::Png);
            assert_eq!(mime_type, "image/png");
            assert_eq!((width, height), (800, 600));
            assert_eq!(&bytes[1..4], b"PNG");
        }
        other => panic!("unexpected result: {:?}", other),
    }
    // the preload packages were already present, so nothing was installed
    assert_eq!(backend.installs.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_image_run_installs_missing_preload() {
    let backend = Arc::new(FakeBackend::default());
    let (engine, _scratch) = engine_with(backend.clone());
    let session = SessionId::new("preload");

    let request = engine
        .image_request(&session, "plot(1:10)", None, None)
        .unwrap();
    assert!(engine.execute(&request).await.is_success());
    // ggplot2 and cowplot
    assert_eq!(backend.installs.load(Ordering::SeqCst), 2);

    // second image run finds both in the cached set
    assert!(engine.execute(&request).await.is_success());
    assert_eq!(backend.installs.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_concurrent_ensure_installs_once() {
    let backend = Arc::new(FakeBackend::default());
    let (engine, _scratch) = engine_with(backend.clone());
    let engine = Arc::new(engine);

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let engine = engine.clone();
            tokio::spawn(async move { engine.ensure_package("dplyr", None, false, None).await })
        })
        .collect();

    for handle in handles {
        let descriptor = handle.await.unwrap().unwrap();
        assert_eq!(descriptor.name, "dplyr");
        assert_eq!(descriptor.version, "1.0.0");
    }
    assert_eq!(backend.installs.load(Ordering::SeqCst), 1);

    let again = engine.ensure_package("dplyr", None, false, None).await.unwrap();
    assert_eq!(again.version, "1.0.0");
    assert_eq!(backend.installs.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_version_constraints() {
    let backend = Arc::new(FakeBackend::with_packages(&[("readr", "2.1.0")]));
    let (engine, _scratch) = engine_with(backend.clone());

    let found = engine
        .ensure_package("readr", Some(">= 2.0"), false, None)
        .await
        .unwrap();
    assert_eq!(found.version, "2.1.0");
    assert_eq!(backend.installs.load(Ordering::SeqCst), 0);

    let pinned = engine
        .ensure_package("readr", Some("2.1.5"), false, None)
        .await
        .unwrap();
    assert_eq!(pinned.version, "2.1.5");
    assert_eq!(backend.installs.load(Ordering::SeqCst), 1);

    let err = engine
        .ensure_package("readr", Some("~> 2"), false, None)
        .await
        .unwrap_err();
    assert!(matches!(err, PackageError::InvalidConstraint(_)));
}

#[tokio::test]
async fn test_install_failure_is_reported_and_retryable() {
    let backend = Arc::new(FakeBackend::default());
    backend
        .failing_packages
        .lock()
        .unwrap()
        .insert("notapkg".to_string());
    let (engine, _scratch) = engine_with(backend.clone());

    let err = engine
        .ensure_package("notapkg", None, false, None)
        .await
        .unwrap_err();
    match err {
        PackageError::InstallFailed { package, reason } => {
            assert_eq!(package, "notapkg");
            assert!(reason.contains("not available"));
        }
        other => panic!("unexpected error: {:?}", other),
    }

    backend.failing_packages.lock().unwrap().clear();
    let descriptor = engine.ensure_package("notapkg", None, false, None).await.unwrap();
    assert_eq!(descriptor.name, "notapkg");
    assert_eq!(backend.installs.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_invalid_package_name_never_reaches_backend() {
    let backend = Arc::new(FakeBackend::default());
    let (engine, _scratch) = engine_with(backend.clone());

    let err = engine
        .ensure_package("bad; system('rm')", None, false, None)
        .await
        .unwrap_err();
    assert!(matches!(err, PackageError::InvalidName(_)));
    assert!(backend.provisioned().is_empty());
}

#[tokio::test]
async fn test_list_packages_with_pattern() {
    let backend = Arc::new(FakeBackend::with_packages(&[
        ("ggplot2", "3.5.1"),
        ("dplyr", "1.1.4"),
        ("data.table", "1.15.0"),
    ]));
    let (engine, _scratch) = engine_with(backend);

    let all = engine.list_packages(None).await.unwrap();
    assert_eq!(all.iter().count(), 3);

    let filtered = engine.list_packages(Some("^D")).await.unwrap();
    let mut names: Vec<String> = filtered.iter().map(|p| p.name).collect();
    names.sort();
    assert_eq!(names, vec!["data.table", "dplyr"]);
}

#[tokio::test]
async fn test_stage_resolve_and_list() {
    let backend = Arc::new(FakeBackend::default());
    let (engine, _scratch) = engine_with(backend);
    let session = SessionId::new("files");

    let staged = engine
        .stage(&session, "sales.csv", b"region,total\nnorth,10\n", None, false)
        .await
        .unwrap();
    let resolved = engine.resolve(&session, "sales.csv").await.unwrap();
    assert_eq!(staged, resolved);
    assert_eq!(
        std::fs::read(&resolved).unwrap(),
        b"region,total\nnorth,10\n"
    );

    engine
        .stage(&session, "notes.txt", b"hello", None, false)
        .await
        .unwrap();
    let csvs = engine
        .list_files(&session, &FileFilter::kind(FileKind::Csv))
        .await
        .unwrap();
    assert_eq!(csvs.len(), 1);
    assert_eq!(csvs[0].name, "sales.csv");

    let info = engine.file_info(&session, "sales.csv").await.unwrap();
    assert_eq!(info.mime_type, "text/csv");
    assert!(info.staged.is_some());

    match engine.resolve(&session, "sale.csv").await.unwrap_err() {
        WorkspaceError::NotFound { suggestions, .. } => {
            assert!(suggestions.contains(&"sales.csv".to_string()))
        }
        other => panic!("unexpected error: {:?}", other),
    }
}

#[tokio::test]
async fn test_stage_rejects_bad_names() {
    let backend = Arc::new(FakeBackend::default());
    let (engine, _scratch) = engine_with(backend);
    let session = SessionId::new("bad-names");

    let err = engine
        .stage(&session, "../escape.csv", b"x", None, false)
        .await
        .unwrap_err();
    assert!(matches!(err, WorkspaceError::InvalidName { .. }));

    let err = engine
        .stage(&session, "payload.exe", b"x", None, false)
        .await
        .unwrap_err();
    assert!(matches!(err, WorkspaceError::UnsupportedType { .. }));
}

#[tokio::test]
async fn test_request_validation() {
    let backend = Arc::new(FakeBackend::default());
    let (engine, _scratch) = engine_with(backend);
    let session = SessionId::new("validation");

    assert!(engine.text_request(&session, "   ", None).is_err());
    assert!(engine
        .text_request(&session, "1", Some(Duration::from_secs(100_000)))
        .is_err());
    assert!(ImageParams::new(ImageFormat::Png, 50, 600, 150).is_err());
    assert!(ImageParams::new(ImageFormat::Png, 800, 600, 1200).is_err());
}

#[tokio::test]
async fn test_force_reinstall_replaces_present_package() {
    let backend = Arc::new(FakeBackend::with_packages(&[("dplyr", "0.9.0")]));
    let (engine, _scratch) = engine_with(backend.clone());

    let present = engine.ensure_package("dplyr", None, false, None).await.unwrap();
    assert_eq!(present.version, "0.9.0");
    assert_eq!(backend.installs.load(Ordering::SeqCst), 0);

    let forced = engine.ensure_package("dplyr", None, true, None).await.unwrap();
    assert_eq!(forced.version, "1.0.0");
    assert_eq!(forced.title.as_deref(), Some("The dplyr package"));
    assert_eq!(backend.installs.load(Ordering::SeqCst), 1);

    // the cached set now holds the new version; no listing or install runs
    let provisioned = backend.provisioned().len();
    let again = engine.ensure_package("dplyr", None, false, None).await.unwrap();
    assert_eq!(again.version, "1.0.0");
    assert_eq!(backend.installs.load(Ordering::SeqCst), 1);
    assert_eq!(backend.provisioned().len(), provisioned);

    let listed: Vec<_> = engine.list_packages(Some("dplyr")).await.unwrap().iter().collect();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].version, "1.0.0");
}

#[tokio::test]
async fn test_install_from_call_repository() {
    let backend = Arc::new(FakeBackend::default());
    let (engine, _scratch) = engine_with(backend.clone());

    let err = engine
        .ensure_package("sf", None, false, Some("ftp://mirror.example.org"))
        .await
        .unwrap_err();
    assert!(matches!(err, PackageError::InvalidRepository(_)));
    assert!(backend.provisioned().is_empty());

    engine
        .ensure_package("sf", None, false, Some("https://r-spatial.r-universe.dev"))
        .await
        .unwrap();
    engine.ensure_package("terra", None, false, None).await.unwrap();
    assert_eq!(
        backend.repositories(),
        vec![
            "https://r-spatial.r-universe.dev".to_string(),
            engine.config().packages.repository.clone(),
        ]
    );
}

#[tokio::test]
async fn test_list_packages_reports_titles() {
    let backend = Arc::new(FakeBackend::with_packages(&[("ggplot2", "3.5.1")]));
    let (engine, _scratch) = engine_with(backend);

    let listing = engine.list_packages(None).await.unwrap();
    let ggplot2 = listing.iter().next().unwrap();
    assert_eq!(ggplot2.title.as_deref(), Some("The ggplot2 package"));
}

#[tokio::test]
async fn test_stage_refuses_existing_name_without_overwrite() {
    let backend = Arc::new(FakeBackend::default());
    let (engine, _scratch) = engine_with(backend);
    let session = SessionId::new("no-clobber");

    let path = engine
        .stage(&session, "a.csv", b"original", None, false)
        .await
        .unwrap();
    let err = engine
        .stage(&session, "a.csv", b"clobbered", None, false)
        .await
        .unwrap_err();
    assert!(matches!(err, WorkspaceError::AlreadyExists { .. }));
    assert_eq!(err.kind(), FailureKind::AlreadyExists);
    assert_eq!(std::fs::read(&path).unwrap(), b"original");

    engine
        .stage(&session, "a.csv", b"replaced", None, true)
        .await
        .unwrap();
    assert_eq!(std::fs::read(&path).unwrap(), b"replaced");
}

#[tokio::test]
async fn test_file_info_reports_spreadsheet_details() {
    let backend = Arc::new(FakeBackend::default());
    let (engine, _scratch) = engine_with(backend.clone());
    let session = SessionId::new("sheets");

    engine
        .stage(&session, "sales.xlsx", b"PK\x03\x04", None, false)
        .await
        .unwrap();
    let info = engine.file_info(&session, "sales.xlsx").await.unwrap();
    let excel = info.excel.expect("spreadsheet details");
    assert_eq!(excel.sheets, vec!["Sheet1", "Totals"]);
    assert_eq!((excel.rows, excel.columns), (3, 2));
    assert_eq!(excel.column_names, vec!["region", "sales"]);
    // the reader package was installed once
    assert_eq!(backend.installs.load(Ordering::SeqCst), 1);

    let json = serde_json::to_value(&engine.file_info(&session, "sales.xlsx").await.unwrap()).unwrap();
    assert_eq!(json["excel"]["sheets"][1], "Totals");
    assert_eq!(backend.installs.load(Ordering::SeqCst), 1);

    engine
        .stage(&session, "broken.xlsx", b"not a zip", None, false)
        .await
        .unwrap();
    let info = engine.file_info(&session, "broken.xlsx").await.unwrap();
    assert!(info.excel.is_none());

    let runs = backend.executed_in().len();
    engine
        .stage(&session, "plain.csv", b"a\n1\n", None, false)
        .await
        .unwrap();
    let info = engine.file_info(&session, "plain.csv").await.unwrap();
    assert!(info.excel.is_none());
    assert_eq!(backend.executed_in().len(), runs);
}

#[tokio::test]
async fn test_close_session_releases_idle_environment() {
    let backend = Arc::new(FakeBackend::default());
    let (engine, _scratch) = engine_with(backend.clone());
    let session = SessionId::new("closing");

    let request = engine.text_request(&session, "1+1", None).unwrap();
    assert!(engine.execute(&request).await.is_success());
    let env = backend.executed_in()[0].clone();
    assert!(!backend.destroyed().contains(&env));

    assert!(engine.close_session(&session).await);
    assert!(backend.destroyed().contains(&env));
    assert!(!engine.close_session(&session).await);
}

#[tokio::test]
async fn test_list_files_newest_first() {
    let backend = Arc::new(FakeBackend::default());
    let (engine, _scratch) = engine_with(backend);
    let session = SessionId::new("ordering");

    let now = std::time::SystemTime::now();
    for (name, age) in [("first.csv", 120), ("second.csv", 60), ("third.csv", 0)] {
        let path = engine
            .stage(&session, name, b"x", None, false)
            .await
            .unwrap();
        std::fs::File::options()
            .write(true)
            .open(&path)
            .unwrap()
            .set_modified(now - Duration::from_secs(age))
            .unwrap();
    }
    let names: Vec<String> = engine
        .list_files(&session, &FileFilter::default())
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.name)
        .collect();
    assert_eq!(names, vec!["third.csv", "second.csv", "first.csv"]);
}
