use hozon::{Asset, Dispatch, DownloadState, Downloader, DownloaderConfig, Event, EventBus};
use url::Url;
use wiremock::{
    matchers::{method, path},
    Mock, MockServer, ResponseTemplate,
};

use crate::common::wait_for_state;

trait HlsMock {
    async fn mock<S>(&self, mock_path: &str, body: S) -> &Self
    where
        S: AsRef<str>;
}

impl HlsMock for MockServer {
    async fn mock<S>(&self, mock_path: &str, body: S) -> &Self
    where
        S: AsRef<str>,
    {
        Mock::given(method("GET"))
            .and(path(mock_path))
            .respond_with(ResponseTemplate::new(200).set_body_string(body.as_ref()))
            .mount(self)
            .await;
        self
    }
}

async fn setup_mock_server() -> MockServer {
    let server = MockServer::start().await;
    server
        .mock(
            "/x/master.m3u8",
            "#EXTM3U
#EXT-X-MEDIA:TYPE=SUBTITLES,GROUP-ID=\"subs\",NAME=\"English\",URI=\"subs/en.m3u8\"
#EXT-X-STREAM-INF:BANDWIDTH=2000000,SUBTITLES=\"subs\"
video/720p.m3u8?token=abc
",
        )
        .await
        .mock(
            "/x/video/720p.m3u8",
            "#EXTM3U
#EXT-X-TARGETDURATION:10
#EXT-X-VERSION:3
#EXTINF:9.009,
seg0.ts
#EXTINF:9.009,
seg1.ts
#EXT-X-ENDLIST",
        )
        .await
        .mock("/x/video/seg0.ts", "segment-0")
        .await
        .mock("/x/video/seg1.ts", "segment-1")
        .await
        .mock(
            "/x/subs/en.m3u8",
            "#EXTM3U
#EXTINF:60,
en0.vtt
#EXT-X-ENDLIST",
        )
        .await
        .mock("/x/subs/en0.vtt", "WEBVTT")
        .await;
    server
}

#[tokio::test]
async fn test_download_over_http() -> anyhow::Result<()> {
    let server = setup_mock_server().await;
    let dir = tempfile::tempdir()?;
    let base = dir.path().join("offline");

    let events = EventBus::default();
    let mut rx = events.subscribe();
    let downloader = Downloader::builder(DownloaderConfig::new(&base))
        .events(events)
        .start()?;

    let url = Url::parse(&format!("{}/x/master.m3u8", server.uri()))?;
    let asset = Asset::new("lecture", "content-7", "7001", url.clone());
    assert_eq!(downloader.download(asset.clone()).await?, Dispatch::Started);
    let seen = wait_for_state(&mut rx, "lecture", DownloadState::Downloaded).await;
    assert_eq!(seen.first(), Some(&Event::RestoreComplete));

    let program = base.join("7001");
    let host = &url[url::Position::BeforeHost..url::Position::BeforePath];
    let mirrored = program.join(host).join("x");
    assert_eq!(
        std::fs::read_to_string(mirrored.join("video/seg0.ts"))?,
        "segment-0"
    );
    assert_eq!(
        std::fs::read_to_string(mirrored.join("video/seg1.ts"))?,
        "segment-1"
    );
    assert_eq!(
        std::fs::read_to_string(mirrored.join("subs/en0.vtt"))?,
        "WEBVTT"
    );
    assert!(mirrored.join("video/720p.m3u8").is_file());
    assert!(mirrored.join("subs/en.m3u8").is_file());

    let master = std::fs::read_to_string(program.join("master.m3u8"))?;
    assert!(!master.contains("http://"));
    assert!(master.contains(&format!("{host}/x/video/720p.m3u8?token=abc")));
    assert!(master.contains(&format!("URI=\"{host}/x/subs/en.m3u8\"")));

    assert_eq!(downloader.downloaded()?, vec!["lecture".to_string()]);
    assert!(base.join("index.json").is_file());
    assert_eq!(
        downloader.download(asset).await?,
        Dispatch::AlreadyDownloaded
    );
    Ok(())
}

#[tokio::test]
async fn test_http_failure_removes_asset() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    // missing.ts is not mounted and answers 404
    server
        .mock(
            "/y/master.m3u8",
            "#EXTM3U\n#EXT-X-STREAM-INF:BANDWIDTH=1\nvideo.m3u8\n",
        )
        .await
        .mock(
            "/y/video.m3u8",
            "#EXTM3U\n#EXTINF:4,\nseg0.ts\n#EXTINF:4,\nmissing.ts\n",
        )
        .await
        .mock("/y/seg0.ts", "segment-0")
        .await;
    let dir = tempfile::tempdir()?;
    let base = dir.path().join("offline");

    let downloader = Downloader::builder(DownloaderConfig::new(&base)).start()?;
    let mut rx = downloader.subscribe();

    let url = Url::parse(&format!("{}/y/master.m3u8", server.uri()))?;
    downloader
        .download(Asset::new("lecture", "content-7", "7001", url))
        .await?;
    wait_for_state(&mut rx, "lecture", DownloadState::NotDownloaded).await;

    assert!(!base.join("7001").exists());
    assert!(downloader.downloaded()?.is_empty());
    assert_eq!(
        downloader.state("lecture").await?,
        DownloadState::NotDownloaded
    );
    Ok(())
}
