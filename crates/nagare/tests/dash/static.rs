use nagare::{open_dash, DashParams, HttpClient, NagareError, StreamOptions, StreamOutput};
use reqwest::Url;
use tokio::time::timeout;
use wiremock::{
    matchers::{method, path},
    Mock, MockServer, ResponseTemplate,
};

use super::DashMock;
use crate::{body, init_tracing, read_to_end, single, TIMEOUT};

const VIDEO_SET: &str = r#"
    <AdaptationSet contentType="video" mimeType="video/mp4" segmentAlignment="true">
      <SegmentTemplate timescale="1000" duration="4000" startNumber="1" media="$RepresentationID$/seg-$Number$.m4s" initialization="$RepresentationID$/init.m4s"/>
      <Representation id="v720" bandwidth="1500000" width="1280" height="720" codecs="avc1.64001f"/>
    </AdaptationSet>"#;

const AUDIO_SET: &str = r#"
    <AdaptationSet contentType="audio" mimeType="audio/mp4" lang="en">
      <SegmentTemplate timescale="1000" duration="4000" startNumber="1" media="$RepresentationID$/seg-$Number$.m4s" initialization="$RepresentationID$/init.m4s"/>
      <Representation id="a128" bandwidth="128000" codecs="mp4a.40.2"/>
    </AdaptationSet>"#;

/// A 40s presentation of 4s segments.
fn number_template(audio: bool) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<MPD xmlns="urn:mpeg:dash:schema:mpd:2011" type="static" mediaPresentationDuration="PT40S" minBufferTime="PT2S" profiles="urn:mpeg:dash:profile:isoff-live:2011">
  <Period id="p0" duration="PT40S">
    <BaseURL>media/</BaseURL>{VIDEO_SET}{}
  </Period>
</MPD>
"#,
        if audio { AUDIO_SET } else { "" }
    )
}

/// Mounts the init section and ten media segments of `rep`, returning what a
/// reader of it should see.
async fn mount_representation(server: &MockServer, rep: &str) -> Vec<u8> {
    let init = body(&format!("{rep}:init;"), 120);
    server.mock(&format!("/dash/media/{rep}/init.m4s"), init.clone()).await;
    let mut expected = init;
    for number in 1..=10 {
        let data = body(&format!("{rep}:{number};"), 500 + number * 10);
        server
            .mock(&format!("/dash/media/{rep}/seg-{number}.m4s"), data.clone())
            .await;
        expected.extend(data);
    }
    expected
}

#[tokio::test]
async fn static_number_template() -> anyhow::Result<()> {
    init_tracing();
    let server = MockServer::start().await;
    server
        .mock_manifest("/dash/manifest.mpd", &number_template(false))
        .await;
    let expected = mount_representation(&server, "v720").await;

    let options = StreamOptions {
        segment_threads: 3,
        ..Default::default()
    };
    let url = Url::parse(&format!("{}/dash/manifest.mpd", server.uri()))?;
    let output = open_dash(
        &HttpClient::default(),
        &url,
        DashParams::default(),
        options,
        Some("v720"),
        None,
    )
    .await?;
    let reader = single(output)?;

    let data = timeout(TIMEOUT, read_to_end(&reader)).await?;
    assert_eq!(data, expected);
    assert!(reader.error().is_none());

    // one init section and ten media segments
    let requests = server.received_requests().await.unwrap_or_default();
    let segments = requests
        .iter()
        .filter(|request| request.url.path().starts_with("/dash/media/v720/"))
        .count();
    assert_eq!(segments, 11);

    Ok(())
}

#[tokio::test]
async fn static_video_and_audio_open_muxed() -> anyhow::Result<()> {
    init_tracing();
    let server = MockServer::start().await;
    server
        .mock_manifest("/dash/manifest.mpd", &number_template(true))
        .await;
    let expected_video = mount_representation(&server, "v720").await;
    let expected_audio = mount_representation(&server, "a128").await;

    let url = Url::parse(&format!("{}/dash/manifest.mpd", server.uri()))?;
    let output = open_dash(
        &HttpClient::default(),
        &url,
        DashParams::default(),
        StreamOptions::default(),
        None,
        None,
    )
    .await?;
    let StreamOutput::Muxed { video, audio } = output else {
        anyhow::bail!("expected video and audio readers");
    };

    let (video, audio) = tokio::join!(read_to_end(&video), read_to_end(&audio[0]));
    assert_eq!(video, expected_video);
    assert_eq!(audio, expected_audio);

    Ok(())
}

#[tokio::test]
async fn segment_base_reads_whole_resource() -> anyhow::Result<()> {
    init_tracing();
    let server = MockServer::start().await;
    server
        .mock_manifest(
            "/ondemand/manifest.mpd",
            r#"<MPD type="static" mediaPresentationDuration="PT10S">
  <Period>
    <AdaptationSet mimeType="video/mp4">
      <Representation id="1" bandwidth="800000" height="480">
        <BaseURL>video.mp4</BaseURL>
        <SegmentBase indexRange="100-199">
          <Initialization range="0-99"/>
        </SegmentBase>
      </Representation>
    </AdaptationSet>
  </Period>
</MPD>"#,
        )
        .await;
    let file = body("whole file;", 5000);
    Mock::given(method("GET"))
        .and(path("/ondemand/video.mp4"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(file.clone()))
        .expect(1)
        .mount(&server)
        .await;

    let url = Url::parse(&format!("{}/ondemand/manifest.mpd", server.uri()))?;
    let reader = single(
        open_dash(
            &HttpClient::default(),
            &url,
            DashParams::default(),
            StreamOptions::default(),
            None,
            None,
        )
        .await?,
    )?;

    let data = timeout(TIMEOUT, read_to_end(&reader)).await?;
    assert_eq!(data, file);

    Ok(())
}

#[tokio::test]
async fn protected_content_is_rejected() -> anyhow::Result<()> {
    init_tracing();
    let server = MockServer::start().await;
    server
        .mock_manifest(
            "/drm/manifest.mpd",
            r#"<MPD xmlns="urn:mpeg:dash:schema:mpd:2011" xmlns:cenc="urn:mpeg:cenc:2013" type="static" mediaPresentationDuration="PT10S">
  <Period>
    <AdaptationSet mimeType="video/mp4">
      <ContentProtection schemeIdUri="urn:mpeg:dash:mp4protection:2011" value="cenc" cenc:default_KID="10000000-1000-1000-1000-100000000001"/>
      <SegmentTemplate duration="2" media="$Number$.m4s"/>
      <Representation id="1" bandwidth="800000"/>
    </AdaptationSet>
  </Period>
</MPD>"#,
        )
        .await;

    let url = Url::parse(&format!("{}/drm/manifest.mpd", server.uri()))?;
    let result = open_dash(
        &HttpClient::default(),
        &url,
        DashParams::default(),
        StreamOptions::default(),
        None,
        None,
    )
    .await;
    assert!(matches!(result, Err(NagareError::DrmProtected(_))));

    Ok(())
}

#[tokio::test]
async fn unknown_representation_id() -> anyhow::Result<()> {
    init_tracing();
    let server = MockServer::start().await;
    server
        .mock_manifest("/dash/manifest.mpd", &number_template(true))
        .await;

    let url = Url::parse(&format!("{}/dash/manifest.mpd", server.uri()))?;
    let result = open_dash(
        &HttpClient::default(),
        &url,
        DashParams::default(),
        StreamOptions::default(),
        Some("v4k"),
        None,
    )
    .await;
    assert!(matches!(result, Err(NagareError::NoRepresentationFound(id)) if id == "v4k"));

    Ok(())
}
