use std::{
    path::Path,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use futures::future::BoxFuture;
use hozon::{
    drm::{DrmScope, KeyProvider},
    index::{KeyValueStore, MemoryStore},
    registry::Stage,
    transport::{MediaKind, MediaSelection},
    Asset, Dispatch, DownloadState, Downloader, DownloaderConfig, Event, EventBus, HozonError,
    HozonResult,
};
use url::Url;

use crate::common::{state_changes, wait_for_state, wait_until, MockTransport, Route};

const MASTER: &str = r#"#EXTM3U
#EXT-X-MEDIA:TYPE=SUBTITLES,GROUP-ID="subs",NAME="English",LANGUAGE="en",URI="subs/en.m3u8"
#EXT-X-STREAM-INF:BANDWIDTH=2000000,SUBTITLES="subs"
video/720p.m3u8
#EXT-X-STREAM-INF:BANDWIDTH=5000000,SUBTITLES="subs"
video/1080p.m3u8
"#;

const VIDEO: &str = "#EXTM3U
#EXT-X-TARGETDURATION:4
#EXTINF:4,
https://cdn/x/video/0.ts
#EXTINF:4,
1.ts
#EXTINF:4,
2.ts
#EXT-X-ENDLIST
";

const SUBTITLES: &str = "#EXTM3U
#EXTINF:60,
0.vtt
#EXTINF:60,
1.vtt
#EXT-X-ENDLIST
";

fn asset(name: &str) -> Asset {
    Asset::new(
        name,
        "content-1",
        "394234",
        Url::parse("https://cdn/x/master.m3u8").unwrap(),
    )
}

fn full_routes(transport: &MockTransport) {
    transport
        .body("https://cdn/x/master.m3u8", MASTER)
        .body("https://cdn/x/video/720p.m3u8", VIDEO)
        .body("https://cdn/x/video/0.ts", "v0")
        .body("https://cdn/x/video/1.ts", "v1")
        .body("https://cdn/x/video/2.ts", "v2")
        .body("https://cdn/x/subs/en.m3u8", SUBTITLES)
        .body("https://cdn/x/subs/0.vtt", "s0")
        .body("https://cdn/x/subs/1.vtt", "s1");
}

struct Service {
    downloader: Downloader,
    transport: Arc<MockTransport>,
    store: Arc<MemoryStore>,
    _dir: tempfile::TempDir,
    base: std::path::PathBuf,
}

fn start(setup: impl FnOnce(&MockTransport)) -> Service {
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().join("offline");
    let transport = MockTransport::new(&dir.path().join("tmp"));
    setup(&transport);
    let store = Arc::new(MemoryStore::new());

    let downloader = Downloader::builder(DownloaderConfig::new(&base))
        .transport(transport.clone())
        .store(store.clone())
        .start()
        .unwrap();

    Service {
        downloader,
        transport,
        store,
        _dir: dir,
        base,
    }
}

#[tokio::test]
async fn test_full_pipeline() -> anyhow::Result<()> {
    let service = start(full_routes);
    let mut rx = service.downloader.subscribe();

    let dispatch = service.downloader.download(asset("show")).await?;
    assert_eq!(dispatch, Dispatch::Started);

    let events = wait_for_state(&mut rx, "show", DownloadState::Downloaded).await;
    assert_eq!(
        state_changes(&events, "show"),
        vec![DownloadState::Downloading, DownloadState::Downloaded]
    );
    assert!(events
        .iter()
        .any(|e| matches!(e, Event::ProgressChanged { asset_name, .. } if asset_name == "show")));

    // master + video + 3 segments + subtitles + 2 subtitle segments
    assert_eq!(service.transport.completions(), 8);
    let started = service.transport.started();
    assert_eq!(started.len(), 8);
    assert_eq!(
        started.iter().filter(|s| s.stage == Stage::Segment).count(),
        3
    );
    assert_eq!(
        started
            .iter()
            .filter(|s| s.stage == Stage::SubtitleSegment)
            .count(),
        2
    );
    assert!(started.iter().all(|s| !s.keyed));

    let program = service.base.join("394234");
    for file in [
        "cdn/x/video/720p.m3u8",
        "cdn/x/video/0.ts",
        "cdn/x/video/1.ts",
        "cdn/x/video/2.ts",
        "cdn/x/subs/en.m3u8",
        "cdn/x/subs/0.vtt",
        "cdn/x/subs/1.vtt",
    ] {
        assert!(program.join(file).is_file(), "{file} is missing");
    }

    for manifest in ["master.m3u8", "cdn/x/video/720p.m3u8", "cdn/x/subs/en.m3u8"] {
        let text = std::fs::read_to_string(program.join(manifest))?;
        assert!(!text.contains("http://") && !text.contains("https://"));
    }
    let master = std::fs::read_to_string(program.join("master.m3u8"))?;
    assert!(master.contains("URI=\"cdn/x/subs/en.m3u8\""));

    assert_eq!(
        service.downloader.state("show").await?,
        DownloadState::Downloaded
    );
    assert_eq!(service.downloader.downloaded()?, vec!["show".to_string()]);

    // nothing else is reported for the asset afterwards
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    while let Ok(event) = rx.try_recv() {
        assert!(!matches!(event, Event::StateChanged { .. }), "{event:?}");
    }
    Ok(())
}

#[tokio::test]
async fn test_relative_video_manifest() -> anyhow::Result<()> {
    let service = start(|t| {
        t.body(
            "https://cdn/x/master.m3u8",
            "#EXTM3U\n#EXT-X-STREAM-INF:BANDWIDTH=1\nvideo/720p.m3u8\n",
        )
        .body("https://cdn/x/video/720p.m3u8", "#EXTM3U\n#EXTINF:4,\na.ts\n")
        .body("https://cdn/x/video/a.ts", "a");
    });
    let mut rx = service.downloader.subscribe();

    service.downloader.download(asset("show")).await?;
    wait_for_state(&mut rx, "show", DownloadState::Downloaded).await;

    let started = service.transport.started();
    assert_eq!(started[1].url, "https://cdn/x/video/720p.m3u8");
    assert_eq!(started[1].stage, Stage::VideoManifest);
    assert_eq!(service.transport.completions(), 3);

    let program = service.base.join("394234");
    assert!(program.join("cdn/x/video/720p.m3u8").is_file());
    let master = std::fs::read_to_string(program.join("master.m3u8"))?;
    assert!(master.contains("\ncdn/x/video/720p.m3u8\n"));

    assert_eq!(
        service.store.get("show")?.map(|v| v.contains("394234/master.m3u8")),
        Some(true)
    );
    Ok(())
}

#[tokio::test]
async fn test_failed_segment_cleans_up() -> anyhow::Result<()> {
    let service = start(|t| {
        full_routes(t);
        t.route("https://cdn/x/video/1.ts", Route::Fail);
    });
    let mut rx = service.downloader.subscribe();

    service.downloader.download(asset("show")).await?;
    let events = wait_for_state(&mut rx, "show", DownloadState::NotDownloaded).await;
    assert_eq!(
        state_changes(&events, "show"),
        vec![DownloadState::Downloading, DownloadState::NotDownloaded]
    );

    assert_eq!(
        service.downloader.state("show").await?,
        DownloadState::NotDownloaded
    );
    assert!(service.store.get("show")?.is_none());
    assert!(!service.base.join("394234").exists());
    assert!(service.downloader.downloaded()?.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_failed_master_leaves_nothing() -> anyhow::Result<()> {
    let service = start(|t| {
        t.route("https://cdn/x/master.m3u8", Route::Fail);
    });
    let mut rx = service.downloader.subscribe();

    service.downloader.download(asset("show")).await?;
    let events = wait_for_state(&mut rx, "show", DownloadState::NotDownloaded).await;
    assert_eq!(
        state_changes(&events, "show"),
        vec![DownloadState::Downloading, DownloadState::NotDownloaded]
    );

    assert_eq!(service.transport.started().len(), 1);
    assert!(service.store.keys()?.is_empty());
    assert!(!service.base.join("394234").exists());
    Ok(())
}

/// Accepts everything except marking an asset complete.
#[derive(Default)]
struct RejectingStore {
    inner: MemoryStore,
}

impl KeyValueStore for RejectingStore {
    fn get(&self, key: &str) -> HozonResult<Option<String>> {
        self.inner.get(key)
    }

    fn set(&self, key: &str, value: &str) -> HozonResult<()> {
        if value.contains(r#""complete":true"#) {
            return Err(std::io::Error::new(std::io::ErrorKind::Other, "disk full").into());
        }
        self.inner.set(key, value)
    }

    fn remove(&self, key: &str) -> HozonResult<()> {
        self.inner.remove(key)
    }

    fn keys(&self) -> HozonResult<Vec<String>> {
        self.inner.keys()
    }
}

#[tokio::test]
async fn test_unrecorded_completion_cleans_up() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let base = dir.path().join("offline");
    let transport = MockTransport::new(&dir.path().join("tmp"));
    full_routes(&transport);
    let store = Arc::new(RejectingStore::default());

    let downloader = Downloader::builder(DownloaderConfig::new(&base))
        .transport(transport)
        .store(store.clone())
        .start()?;
    let mut rx = downloader.subscribe();

    downloader.download(asset("show")).await?;
    let events = wait_for_state(&mut rx, "show", DownloadState::NotDownloaded).await;
    assert!(!state_changes(&events, "show").contains(&DownloadState::Downloaded));

    assert!(store.keys()?.is_empty());
    assert!(!base.join("394234").exists());
    Ok(())
}

#[tokio::test]
async fn test_shared_program_rejected() -> anyhow::Result<()> {
    let service = start(full_routes);
    let mut rx = service.downloader.subscribe();

    service.downloader.download(asset("show")).await?;
    wait_for_state(&mut rx, "show", DownloadState::Downloaded).await;

    let result = service.downloader.download(asset("rerun")).await;
    assert!(matches!(
        result,
        Err(HozonError::ProgramInUse(program, owner)) if program == "394234" && owner == "show"
    ));
    assert_eq!(service.transport.started().len(), 8);
    assert!(service.base.join("394234/master.m3u8").is_file());
    Ok(())
}

#[tokio::test]
async fn test_shared_program_rejected_while_active() -> anyhow::Result<()> {
    let service = start(|t| {
        t.route("https://cdn/x/master.m3u8", Route::Hold);
    });

    service.downloader.download(asset("show")).await?;
    let result = service.downloader.download(asset("rerun")).await;
    assert!(matches!(result, Err(HozonError::ProgramInUse(_, owner)) if owner == "show"));
    assert_eq!(service.transport.started().len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_missing_segments_is_failure() -> anyhow::Result<()> {
    let service = start(|t| {
        t.body("https://cdn/x/master.m3u8", MASTER)
            .body("https://cdn/x/video/720p.m3u8", "#EXTM3U\n#EXT-X-ENDLIST\n")
            .body("https://cdn/x/subs/en.m3u8", SUBTITLES)
            .body("https://cdn/x/subs/0.vtt", "s0")
            .body("https://cdn/x/subs/1.vtt", "s1");
    });
    let mut rx = service.downloader.subscribe();

    service.downloader.download(asset("show")).await?;
    wait_for_state(&mut rx, "show", DownloadState::NotDownloaded).await;

    assert!(service.store.get("show")?.is_none());
    assert!(!service.base.join("394234").exists());
    Ok(())
}

#[tokio::test]
async fn test_cancel_mid_pipeline() -> anyhow::Result<()> {
    let service = start(|t| {
        full_routes(t);
        t.route("https://cdn/x/video/2.ts", Route::Hold)
            .route("https://cdn/x/subs/1.vtt", Route::Hold);
    });
    let mut rx = service.downloader.subscribe();

    service.downloader.download(asset("show")).await?;
    let transport = service.transport.clone();
    wait_until(move || transport.held() == 2).await;
    assert_eq!(
        service.downloader.state("show").await?,
        DownloadState::Downloading
    );

    assert!(service.downloader.cancel("show").await?);
    wait_for_state(&mut rx, "show", DownloadState::NotDownloaded).await;

    assert_eq!(service.transport.held(), 0);
    assert_eq!(
        service.downloader.state("show").await?,
        DownloadState::NotDownloaded
    );
    assert!(service.store.get("show")?.is_none());
    assert!(!service.base.join("394234").exists());
    assert!(!service.downloader.cancel("show").await?);
    Ok(())
}

#[tokio::test]
async fn test_failure_cancels_siblings() -> anyhow::Result<()> {
    let service = start(|t| {
        full_routes(t);
        t.route("https://cdn/x/video/0.ts", Route::Hold)
            .route("https://cdn/x/subs/1.vtt", Route::Fail);
    });
    let mut rx = service.downloader.subscribe();

    service.downloader.download(asset("show")).await?;
    wait_for_state(&mut rx, "show", DownloadState::NotDownloaded).await;

    assert_eq!(service.transport.held(), 0);
    assert!(!service.base.join("394234").exists());
    Ok(())
}

#[tokio::test]
async fn test_duplicate_download_is_deduplicated() -> anyhow::Result<()> {
    let service = start(|t| {
        t.route("https://cdn/x/master.m3u8", Route::Hold);
    });

    assert_eq!(
        service.downloader.download(asset("show")).await?,
        Dispatch::Started
    );
    assert_eq!(
        service.downloader.download(asset("show")).await?,
        Dispatch::AlreadyActive
    );
    assert_eq!(service.transport.started().len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_invalid_asset_rejected() {
    let service = start(|_| {});
    let mut bad = asset("show");
    bad.program_id = "../escape".to_string();

    let result = service.downloader.download(bad).await;
    assert!(matches!(result, Err(HozonError::InvalidAsset(_))));
    assert!(service.transport.started().is_empty());
}

#[tokio::test]
async fn test_media_selections_retained() -> anyhow::Result<()> {
    let selection = MediaSelection {
        kind: MediaKind::Audio,
        language: Some("ja".to_string()),
        name: "Japanese".to_string(),
    };
    let service = start(|t| {
        full_routes(t);
        t.route("https://cdn/x/video/0.ts", Route::Hold)
            .selection(selection.clone());
    });

    service.downloader.download(asset("show")).await?;
    let transport = service.transport.clone();
    wait_until(move || transport.held() == 1).await;

    // the report and the query travel on different channels
    let mut selections = Vec::new();
    for _ in 0..100 {
        selections = service.downloader.media_selections("show").await?;
        if !selections.is_empty() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert_eq!(selections, vec![selection]);
    assert!(service
        .downloader
        .media_selections("other")
        .await?
        .is_empty());
    Ok(())
}

#[derive(Debug)]
struct StaticKey {
    scope: DrmScope,
}

impl KeyProvider for StaticKey {
    fn scope(&self) -> &DrmScope {
        &self.scope
    }

    fn content_key<'a>(&'a self, _key_uri: &'a str) -> BoxFuture<'a, HozonResult<Vec<u8>>> {
        Box::pin(async { Ok(vec![0; 16]) })
    }
}

#[tokio::test]
async fn test_drm_binding_before_segments() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let transport = MockTransport::new(&dir.path().join("tmp"));
    transport
        .body(
            "https://cdn/x/master.m3u8",
            "#EXTM3U\n#EXT-X-STREAM-INF:BANDWIDTH=1\nvideo/720p.m3u8\n",
        )
        .body(
            "https://cdn/x/video/720p.m3u8",
            "#EXTM3U\n#EXT-X-KEY:METHOD=SAMPLE-AES,URI=\"skd://394234A_hd_6\"\n#EXTINF:4,\na.ts\n#EXTINF:4,\nb.ts\n",
        )
        .body("https://cdn/x/video/a.ts", "a")
        .body("https://cdn/x/video/b.ts", "b");

    let binds = Arc::new(AtomicUsize::new(0));
    let scopes = Arc::new(Mutex::new(Vec::new()));
    let (binds_inner, scopes_inner) = (binds.clone(), scopes.clone());
    let binder = move |scope: &DrmScope| -> HozonResult<Arc<dyn KeyProvider>> {
        binds_inner.fetch_add(1, Ordering::SeqCst);
        scopes_inner.lock().unwrap().push(scope.clone());
        Ok(Arc::new(StaticKey {
            scope: scope.clone(),
        }))
    };

    let downloader = Downloader::builder(DownloaderConfig::new(dir.path().join("offline")))
        .transport(transport.clone())
        .store(Arc::new(MemoryStore::new()))
        .drm_binder(binder)
        .start()?;
    let mut rx = downloader.subscribe();

    downloader.download(asset("show")).await?;
    wait_for_state(&mut rx, "show", DownloadState::Downloaded).await;

    assert_eq!(binds.load(Ordering::SeqCst), 1);
    assert_eq!(
        scopes.lock().unwrap().clone(),
        vec![DrmScope {
            program_id: "394234".to_string(),
            content_id: "content-1".to_string(),
            key_uri: Some("skd://394234A_hd_6".to_string()),
        }]
    );
    for started in transport.started() {
        assert_eq!(started.keyed, started.stage == Stage::Segment, "{started:?}");
    }
    Ok(())
}

#[tokio::test]
async fn test_failed_binding_aborts() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let transport = MockTransport::new(&dir.path().join("tmp"));
    full_routes(&transport);

    let downloader = Downloader::builder(DownloaderConfig::new(dir.path().join("offline")))
        .transport(transport.clone())
        .store(Arc::new(MemoryStore::new()))
        .drm_binder(|_: &DrmScope| -> HozonResult<Arc<dyn KeyProvider>> {
            Err(HozonError::InvalidAsset("no license".to_string()))
        })
        .start()?;
    let mut rx = downloader.subscribe();

    downloader.download(asset("show").protected(true)).await?;
    wait_for_state(&mut rx, "show", DownloadState::NotDownloaded).await;
    assert!(transport
        .started()
        .iter()
        .all(|s| s.stage != Stage::Segment));
    Ok(())
}

#[tokio::test]
async fn test_delete() -> anyhow::Result<()> {
    let service = start(full_routes);
    let mut rx = service.downloader.subscribe();

    service.downloader.download(asset("show")).await?;
    wait_for_state(&mut rx, "show", DownloadState::Downloaded).await;

    service.downloader.delete("show").await?;
    wait_for_state(&mut rx, "show", DownloadState::NotDownloaded).await;
    assert!(!service.base.join("394234").exists());
    assert_eq!(
        service.downloader.state("show").await?,
        DownloadState::NotDownloaded
    );

    let result = service.downloader.delete("show").await;
    assert!(matches!(result, Err(HozonError::UnknownAsset(_))));
    Ok(())
}

#[tokio::test]
async fn test_restart_resumes_state() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let base = dir.path().join("offline");

    {
        let transport = MockTransport::new(&dir.path().join("tmp"));
        full_routes(&transport);
        let downloader = Downloader::builder(DownloaderConfig::new(&base))
            .transport(transport)
            .start()?;
        let mut rx = downloader.subscribe();
        downloader.download(asset("show")).await?;
        wait_for_state(&mut rx, "show", DownloadState::Downloaded).await;
        downloader.shutdown().await?;
        assert!(matches!(
            downloader.state("show").await,
            Err(HozonError::ServiceStopped)
        ));
    }

    // a fresh process: only the index file and the downloaded files remain
    let transport = MockTransport::new(&dir.path().join("tmp"));
    let events = EventBus::new(16);
    let mut rx = events.subscribe();
    let downloader = Downloader::builder(DownloaderConfig::new(&base))
        .transport(transport.clone())
        .events(events)
        .start()?;

    assert_eq!(rx.recv().await?, Event::RestoreComplete);
    assert_eq!(downloader.state("show").await?, DownloadState::Downloaded);
    assert_eq!(
        downloader.download(asset("show")).await?,
        Dispatch::AlreadyDownloaded
    );
    assert!(transport.started().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_restore_discards_unfinished() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let base = dir.path().join("offline");
    let program = base.join("394234");
    std::fs::create_dir_all(program.join("cdn/x/video"))?;
    std::fs::write(program.join("master.m3u8"), "#EXTM3U\n")?;
    std::fs::write(program.join("cdn/x/video/0.ts"), "v0")?;

    let store = Arc::new(MemoryStore::new());
    store.set(
        "show",
        r#"{"path":"394234/master.m3u8","complete":false}"#,
    )?;
    store.set("gone", "111/master.m3u8")?;

    let events = EventBus::new(16);
    let mut rx = events.subscribe();
    let transport = MockTransport::new(&dir.path().join("tmp"));
    let downloader = Downloader::builder(DownloaderConfig::new(&base))
        .transport(transport)
        .store(store.clone())
        .events(events)
        .start()?;

    assert_eq!(rx.recv().await?, Event::RestoreComplete);
    assert!(!program.exists());
    assert!(store.keys()?.is_empty());
    assert_eq!(
        downloader.state("show").await?,
        DownloadState::NotDownloaded
    );
    assert!(Path::new(&base).is_dir());
    Ok(())
}
