use nagare::{
    open_hls, parse_hls_variants, HlsParams, HttpClient, Stream, StreamOptions, StreamOutput,
    VariantOptions,
};
use reqwest::Url;
use tokio::time::timeout;
use wiremock::MockServer;

use super::{media_playlist, HlsMock};
use crate::{body, init_tracing, read_to_end, TIMEOUT};

const MASTER: &str = r#"#EXTM3U
#EXT-X-INDEPENDENT-SEGMENTS
#EXT-X-MEDIA:TYPE=AUDIO,GROUP-ID="aud",LANGUAGE="en",NAME="English",DEFAULT=YES,AUTOSELECT=YES,URI="audio/en/index.m3u8"
#EXT-X-MEDIA:TYPE=AUDIO,GROUP-ID="aud",LANGUAGE="es",NAME="Espanol",AUTOSELECT=YES,URI="audio/es/index.m3u8"
#EXT-X-STREAM-INF:BANDWIDTH=1280000,RESOLUTION=1280x720,CODECS="avc1.4d401f,mp4a.40.2",AUDIO="aud"
720p/index.m3u8
#EXT-X-STREAM-INF:BANDWIDTH=2560000,RESOLUTION=1920x1080,CODECS="avc1.640028,mp4a.40.2",AUDIO="aud"
1080p/index.m3u8
"#;

/// Mounts the master playlist plus two segments for every media playlist.
async fn mount_master(server: &MockServer) {
    server.mock("/master.m3u8", MASTER).await;
    for dir in ["720p", "1080p", "audio/en", "audio/es"] {
        server
            .mock(&format!("/{dir}/index.m3u8"), media_playlist(4, 0..2, 4., true))
            .await;
        for sequence in 0..2 {
            server
                .mock(&format!("/{dir}/{sequence}.ts"), segment(dir, sequence))
                .await;
        }
    }
}

fn segment(dir: &str, sequence: u64) -> Vec<u8> {
    body(&format!("{dir}:{sequence};"), 300)
}

#[tokio::test]
async fn master_playlist_variants() -> anyhow::Result<()> {
    init_tracing();
    let server = MockServer::start().await;
    server.mock("/master.m3u8", MASTER).await;

    let url = Url::parse(&format!("{}/master.m3u8", server.uri()))?;
    let variants = parse_hls_variants(
        &HttpClient::default(),
        &url,
        HlsParams::default(),
        StreamOptions::default(),
        &VariantOptions::default(),
    )
    .await?;

    assert_eq!(
        variants.keys().collect::<Vec<_>>(),
        ["1080p", "720p", "best", "worst"]
    );
    assert_eq!(variants["best"].url(), variants["1080p"].url());
    assert_eq!(variants["worst"].url(), variants["720p"].url());
    assert_eq!(
        variants["720p"].url().as_str(),
        format!("{}/720p/index.m3u8", server.uri())
    );

    for name in ["720p", "1080p"] {
        let variant = variants[name].variant().expect("declared in a master playlist");
        let languages: Vec<_> = variant
            .media
            .iter()
            .map(|media| media.language.as_deref())
            .collect();
        assert_eq!(languages, [Some("en"), Some("es")]);
    }

    Ok(())
}

#[tokio::test]
async fn sorting_excludes_change_best() -> anyhow::Result<()> {
    init_tracing();
    let server = MockServer::start().await;
    server.mock("/master.m3u8", MASTER).await;

    let url = Url::parse(&format!("{}/master.m3u8", server.uri()))?;
    let variants = parse_hls_variants(
        &HttpClient::default(),
        &url,
        HlsParams::default(),
        StreamOptions::default(),
        &VariantOptions {
            stream_sorting_excludes: vec![">720p".to_string()],
        },
    )
    .await?;

    assert_eq!(variants["best"].url(), variants["720p"].url());
    assert_eq!(variants["worst"].url(), variants["720p"].url());

    Ok(())
}

#[tokio::test]
async fn selected_audio_opens_muxed() -> anyhow::Result<()> {
    init_tracing();
    let server = MockServer::start().await;
    mount_master(&server).await;

    let url = Url::parse(&format!("{}/master.m3u8", server.uri()))?;
    let params = HlsParams {
        audio_select: vec!["es".to_string()],
        ..Default::default()
    };
    let variants = parse_hls_variants(
        &HttpClient::default(),
        &url,
        params,
        StreamOptions::default(),
        &VariantOptions::default(),
    )
    .await?;

    let StreamOutput::Muxed { video, audio } = variants["720p"].open().await? else {
        anyhow::bail!("expected video and audio readers");
    };
    assert_eq!(audio.len(), 1);

    let video = timeout(TIMEOUT, read_to_end(&video)).await?;
    assert_eq!(video, [segment("720p", 0), segment("720p", 1)].concat());
    let audio = timeout(TIMEOUT, read_to_end(&audio[0])).await?;
    assert_eq!(audio, [segment("audio/es", 0), segment("audio/es", 1)].concat());

    Ok(())
}

#[tokio::test]
async fn open_master_playlist_picks_best_variant() -> anyhow::Result<()> {
    init_tracing();
    let server = MockServer::start().await;
    mount_master(&server).await;

    let url = Url::parse(&format!("{}/master.m3u8", server.uri()))?;
    let output = open_hls(
        &HttpClient::default(),
        &url,
        HlsParams::default(),
        StreamOptions::default(),
    )
    .await?;
    let StreamOutput::Muxed { video, audio } = output else {
        anyhow::bail!("expected video and audio readers");
    };

    let video = timeout(TIMEOUT, read_to_end(&video)).await?;
    assert_eq!(video, [segment("1080p", 0), segment("1080p", 1)].concat());
    // without a selection the default rendition is used
    let audio = timeout(TIMEOUT, read_to_end(&audio[0])).await?;
    assert_eq!(audio, [segment("audio/en", 0), segment("audio/en", 1)].concat());

    Ok(())
}
