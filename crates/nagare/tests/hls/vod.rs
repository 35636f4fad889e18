use std::io::Read;

use nagare::{open_hls, HlsParams, HttpClient, NagareError, StreamOptions};
use reqwest::Url;
use tokio::time::timeout;
use wiremock::{
    matchers::{header, method, path},
    Mock, MockServer, ResponseTemplate,
};

use super::{media_playlist, HlsMock};
use crate::{body, init_tracing, read_to_end, single, TIMEOUT};

/// Mounts ten 4s segments of distinct sizes and returns their concatenation.
async fn mount_vod(server: &MockServer) -> Vec<u8> {
    let mut expected = Vec::new();
    for sequence in 0..10 {
        let data = body(&format!("segment{sequence};"), 1000 + sequence * 137);
        server.mock(&format!("/vod/{sequence}.ts"), data.clone()).await;
        expected.extend(data);
    }
    let playlist = media_playlist(4, 0..10, 4., true)
        .replace("#EXT-X-MEDIA-SEQUENCE", "#EXT-X-PLAYLIST-TYPE:VOD\n#EXT-X-MEDIA-SEQUENCE");
    server.mock("/vod/index.m3u8", playlist).await;
    expected
}

#[tokio::test]
async fn vod_segments_are_read_in_order() -> anyhow::Result<()> {
    init_tracing();
    let server = MockServer::start().await;
    let expected = mount_vod(&server).await;

    let options = StreamOptions {
        segment_threads: 4,
        ..Default::default()
    };
    let url = Url::parse(&format!("{}/vod/index.m3u8", server.uri()))?;
    let reader = single(open_hls(&HttpClient::default(), &url, HlsParams::default(), options).await?)?;

    let data = timeout(TIMEOUT, read_to_end(&reader)).await?;
    assert_eq!(data.len(), expected.len());
    assert_eq!(data, expected);
    assert!(reader.error().is_none());
    assert!(reader.shutdown().await);

    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn vod_blocking_reader() -> anyhow::Result<()> {
    init_tracing();
    let server = MockServer::start().await;
    let expected = mount_vod(&server).await;

    let params = HlsParams {
        segment_stream_data: true,
        ..Default::default()
    };
    let url = Url::parse(&format!("{}/vod/index.m3u8", server.uri()))?;
    let mut reader = single(open_hls(&HttpClient::default(), &url, params, StreamOptions::default()).await?)?;

    let data = tokio::task::spawn_blocking(move || -> std::io::Result<Vec<u8>> {
        let mut data = Vec::new();
        reader.read_to_end(&mut data)?;
        Ok(data)
    })
    .await??;
    assert_eq!(data, expected);

    Ok(())
}

#[tokio::test]
async fn byterange_segments_continue_previous_range() -> anyhow::Result<()> {
    init_tracing();
    let server = MockServer::start().await;

    let parts = [body("A", 100), body("B", 50), body("C", 70)];
    for (range, data) in ["bytes=0-99", "bytes=100-149", "bytes=150-219"]
        .into_iter()
        .zip(&parts)
    {
        Mock::given(method("GET"))
            .and(path("/range/all.ts"))
            .and(header("range", range))
            .respond_with(ResponseTemplate::new(206).set_body_bytes(data.clone()))
            .expect(1)
            .mount(&server)
            .await;
    }
    server
        .mock(
            "/range/index.m3u8",
            "#EXTM3U
#EXT-X-VERSION:4
#EXT-X-TARGETDURATION:2
#EXTINF:2.0,
#EXT-X-BYTERANGE:100@0
all.ts
#EXTINF:2.0,
#EXT-X-BYTERANGE:50
all.ts
#EXTINF:2.0,
#EXT-X-BYTERANGE:70
all.ts
#EXT-X-ENDLIST
",
        )
        .await;

    let url = Url::parse(&format!("{}/range/index.m3u8", server.uri()))?;
    let reader = single(
        open_hls(&HttpClient::default(), &url, HlsParams::default(), StreamOptions::default())
            .await?,
    )?;

    let data = timeout(TIMEOUT, read_to_end(&reader)).await?;
    assert_eq!(data, parts.concat());

    Ok(())
}

#[tokio::test]
async fn init_sections_precede_their_segments() -> anyhow::Result<()> {
    init_tracing();
    let server = MockServer::start().await;

    let init1 = body("init1", 64);
    let init2 = body("init2", 80);
    for (name, data) in [("init1.mp4", &init1), ("init2.mp4", &init2)] {
        Mock::given(method("GET"))
            .and(path(format!("/fmp4/{name}")))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(data.clone()))
            .expect(1)
            .mount(&server)
            .await;
    }
    let segments: Vec<_> = (0..5).map(|i| body(&format!("s{i}"), 300)).collect();
    for (i, data) in segments.iter().enumerate() {
        server.mock(&format!("/fmp4/{i}.m4s"), data.clone()).await;
    }
    server
        .mock(
            "/fmp4/index.m3u8",
            "#EXTM3U
#EXT-X-VERSION:7
#EXT-X-TARGETDURATION:2
#EXT-X-MAP:URI=\"init1.mp4\"
#EXTINF:2.0,
0.m4s
#EXTINF:2.0,
1.m4s
#EXTINF:2.0,
2.m4s
#EXT-X-DISCONTINUITY
#EXT-X-MAP:URI=\"init2.mp4\"
#EXTINF:2.0,
3.m4s
#EXTINF:2.0,
4.m4s
#EXT-X-ENDLIST
",
        )
        .await;

    let options = StreamOptions {
        segment_threads: 3,
        ..Default::default()
    };
    let url = Url::parse(&format!("{}/fmp4/index.m3u8", server.uri()))?;
    let reader = single(open_hls(&HttpClient::default(), &url, HlsParams::default(), options).await?)?;

    let data = timeout(TIMEOUT, read_to_end(&reader)).await?;
    let expected = [
        init1.as_slice(),
        segments[0].as_slice(),
        segments[1].as_slice(),
        segments[2].as_slice(),
        init2.as_slice(),
        segments[3].as_slice(),
        segments[4].as_slice(),
    ]
    .concat();
    assert_eq!(data, expected);

    Ok(())
}

#[tokio::test]
async fn failed_and_ignored_segments_are_skipped() -> anyhow::Result<()> {
    init_tracing();
    let server = MockServer::start().await;

    // 2.ts is missing, ad.ts is never requested
    let mut expected = Vec::new();
    for sequence in [0, 1, 3] {
        let data = body(&format!("segment{sequence};"), 500);
        server.mock(&format!("/skip/{sequence}.ts"), data.clone()).await;
        expected.extend(data);
    }
    Mock::given(method("GET"))
        .and(path("/skip/ad.ts"))
        .respond_with(ResponseTemplate::new(200).set_body_string("advertisement"))
        .expect(0)
        .mount(&server)
        .await;
    let playlist = media_playlist(4, 0..4, 4., true).replace(
        "#EXT-X-ENDLIST",
        "#EXTINF:4.000,\nad.ts\n#EXT-X-ENDLIST",
    );
    server.mock("/skip/index.m3u8", playlist).await;

    let params = HlsParams {
        segment_ignore_names: vec!["ad".to_string()],
        ..Default::default()
    };
    let url = Url::parse(&format!("{}/skip/index.m3u8", server.uri()))?;
    let reader = single(open_hls(&HttpClient::default(), &url, params, StreamOptions::default()).await?)?;

    let data = timeout(TIMEOUT, read_to_end(&reader)).await?;
    assert_eq!(data, expected);
    assert!(reader.error().is_none());

    Ok(())
}

#[tokio::test]
async fn failed_first_segment_ends_stream() -> anyhow::Result<()> {
    init_tracing();
    let server = MockServer::start().await;
    server.mock("/broken/1.ts", "never written").await;
    server
        .mock("/broken/index.m3u8", media_playlist(4, 0..2, 4., true))
        .await;

    let url = Url::parse(&format!("{}/broken/index.m3u8", server.uri()))?;
    let reader = single(
        open_hls(&HttpClient::default(), &url, HlsParams::default(), StreamOptions::default())
            .await?,
    )?;

    let data = timeout(TIMEOUT, read_to_end(&reader)).await?;
    assert!(data.is_empty());
    assert!(matches!(
        reader.error().as_deref(),
        Some(NagareError::HttpError { .. })
    ));

    Ok(())
}

#[tokio::test]
async fn invalid_playlist_fails_to_open() -> anyhow::Result<()> {
    init_tracing();
    let server = MockServer::start().await;
    server.mock("/invalid/index.m3u8", "<html></html>").await;

    let url = Url::parse(&format!("{}/invalid/index.m3u8", server.uri()))?;
    let result =
        open_hls(&HttpClient::default(), &url, HlsParams::default(), StreamOptions::default()).await;
    assert!(matches!(result, Err(NagareError::M3u8ParseError(_))));

    Ok(())
}
