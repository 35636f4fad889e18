use std::time::Duration;

use nagare::{open_hls, HlsParams, HttpClient, NagareError, StreamOptions};
use reqwest::Url;
use tokio::time::timeout;
use wiremock::{
    matchers::{method, path},
    Mock, MockServer, ResponseTemplate,
};

use super::{media_playlist, HlsMock};
use crate::{body, encrypt, init_tracing, read_at_least, read_to_end, single, TIMEOUT};

fn restart() -> HlsParams {
    HlsParams {
        live_restart: true,
        ..Default::default()
    }
}

fn big_endian_iv(sequence: u64) -> [u8; 16] {
    let mut iv = [0; 16];
    iv[8..].copy_from_slice(&sequence.to_be_bytes());
    iv
}

#[tokio::test]
async fn live_key_rotation() -> anyhow::Result<()> {
    init_tracing();
    let server = MockServer::start().await;

    let k1 = *b"0123456789abcdef";
    let k2 = *b"fedcba9876543210";
    // each key is fetched once and shared by its segments
    for (name, key) in [("k1", k1), ("k2", k2)] {
        Mock::given(method("GET"))
            .and(path(format!("/live/{name}")))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(key.to_vec()))
            .expect(1)
            .mount(&server)
            .await;
    }

    let explicit_iv = big_endian_iv(1);
    let mut expected = Vec::new();
    for sequence in 1..=5u64 {
        let plain = body(&format!("plain{sequence};"), 1000 + sequence as usize * 7);
        let cipher = if sequence <= 3 {
            encrypt(&k1, &explicit_iv, &plain)
        } else {
            encrypt(&k2, &big_endian_iv(sequence), &plain)
        };
        server.mock(&format!("/live/{sequence}.ts"), cipher).await;
        expected.extend(plain);
    }
    server
        .mock(
            "/live/index.m3u8",
            "#EXTM3U
#EXT-X-VERSION:3
#EXT-X-TARGETDURATION:6
#EXT-X-MEDIA-SEQUENCE:1
#EXT-X-KEY:METHOD=AES-128,URI=\"k1\",IV=0x00000000000000000000000000000001
#EXTINF:6.0,
1.ts
#EXTINF:6.0,
2.ts
#EXTINF:6.0,
3.ts
#EXT-X-KEY:METHOD=AES-128,URI=\"k2\"
#EXTINF:6.0,
4.ts
#EXTINF:6.0,
5.ts
",
        )
        .await;

    let options = StreamOptions {
        segment_threads: 2,
        ..Default::default()
    };
    let url = Url::parse(&format!("{}/live/index.m3u8", server.uri()))?;
    let reader = single(open_hls(&HttpClient::default(), &url, restart(), options).await?)?;

    let data = timeout(TIMEOUT, read_at_least(&reader, expected.len())).await?;
    assert_eq!(data, expected);
    assert!(reader.shutdown().await);

    Ok(())
}

#[tokio::test]
async fn live_edge_one_starts_at_last_segment() -> anyhow::Result<()> {
    init_tracing();
    let server = MockServer::start().await;
    for sequence in 10..15 {
        server
            .mock(&format!("/edge/{sequence}.ts"), body(&format!("s{sequence}"), 400))
            .await;
    }
    server
        .mock("/edge/index.m3u8", media_playlist(2, 10..15, 2., false))
        .await;

    let params = HlsParams {
        live_edge: 1,
        ..Default::default()
    };
    let url = Url::parse(&format!("{}/edge/index.m3u8", server.uri()))?;
    let reader = single(open_hls(&HttpClient::default(), &url, params, StreamOptions::default()).await?)?;

    let data = timeout(TIMEOUT, read_at_least(&reader, 400)).await?;
    assert_eq!(&data[..400], body("s14", 400).as_slice());
    assert!(reader.shutdown().await);

    Ok(())
}

#[tokio::test]
async fn reload_appends_new_segments_until_endlist() -> anyhow::Result<()> {
    init_tracing();
    let server = MockServer::start().await;

    let mut expected = Vec::new();
    for sequence in 0..5 {
        let data = body(&format!("segment{sequence};"), 600);
        server.mock(&format!("/grow/{sequence}.ts"), data.clone()).await;
        expected.extend(data);
    }
    Mock::given(method("GET"))
        .and(path("/grow/index.m3u8"))
        .respond_with(ResponseTemplate::new(200).set_body_string(media_playlist(1, 0..3, 1., false)))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    server
        .mock("/grow/index.m3u8", media_playlist(1, 0..5, 1., true))
        .await;

    let url = Url::parse(&format!("{}/grow/index.m3u8", server.uri()))?;
    let reader = single(open_hls(&HttpClient::default(), &url, restart(), StreamOptions::default()).await?)?;

    let data = timeout(TIMEOUT, read_to_end(&reader)).await?;
    assert_eq!(data, expected);
    assert!(reader.error().is_none());

    Ok(())
}

#[tokio::test]
async fn reload_failure_is_reported() -> anyhow::Result<()> {
    init_tracing();
    let server = MockServer::start().await;

    let mut expected = Vec::new();
    for sequence in 0..3 {
        let data = body(&format!("segment{sequence};"), 600);
        server.mock(&format!("/gone/{sequence}.ts"), data.clone()).await;
        expected.extend(data);
    }
    // later reloads get a 404
    Mock::given(method("GET"))
        .and(path("/gone/index.m3u8"))
        .respond_with(ResponseTemplate::new(200).set_body_string(media_playlist(1, 0..3, 1., false)))
        .up_to_n_times(1)
        .mount(&server)
        .await;

    let params = HlsParams {
        playlist_reload_attempts: 1,
        ..restart()
    };
    let url = Url::parse(&format!("{}/gone/index.m3u8", server.uri()))?;
    let reader = single(open_hls(&HttpClient::default(), &url, params, StreamOptions::default()).await?)?;

    let data = timeout(TIMEOUT, read_to_end(&reader)).await?;
    assert_eq!(data, expected);
    assert!(matches!(
        reader.error().as_deref(),
        Some(NagareError::PlaylistReloadFailed(1))
    ));

    Ok(())
}

#[tokio::test]
async fn close_mid_stream() -> anyhow::Result<()> {
    init_tracing();
    let server = MockServer::start().await;
    for sequence in 0..5 {
        server
            .mock(&format!("/close/{sequence}.ts"), body(&format!("{sequence}"), 32 * 1024))
            .await;
    }
    server
        .mock("/close/index.m3u8", media_playlist(6, 0..5, 6., false))
        .await;

    let options = StreamOptions {
        close_grace: Duration::from_secs(2),
        ..Default::default()
    };
    let url = Url::parse(&format!("{}/close/index.m3u8", server.uri()))?;
    let reader = single(open_hls(&HttpClient::default(), &url, restart(), options).await?)?;

    let data = timeout(TIMEOUT, read_at_least(&reader, 64 * 1024)).await?;
    assert!(data.len() >= 64 * 1024);

    reader.close();
    reader.close();
    assert!(reader.is_closed());
    let mut buf = [0u8; 1024];
    assert_eq!(reader.read_async(&mut buf).await, 0);
    assert!(timeout(Duration::from_secs(3), reader.shutdown()).await?);
    assert!(reader.error().is_none());

    Ok(())
}
