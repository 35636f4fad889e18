use nagare::{
    parse_dash_variants, parse_variants, DashParams, HlsParams, HttpClient, StreamOptions,
    StreamVariant, VariantOptions,
};
use reqwest::Url;
use wiremock::MockServer;

use super::DashMock;
use crate::init_tracing;

const MULTI_AUDIO: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<MPD xmlns="urn:mpeg:dash:schema:mpd:2011" type="static" mediaPresentationDuration="PT1M">
  <Period>
    <AdaptationSet contentType="video" mimeType="video/mp4">
      <SegmentTemplate timescale="1000" duration="2000" media="$RepresentationID$/$Number$.m4s"/>
      <Representation id="v1080" bandwidth="4000000" width="1920" height="1080" frameRate="60"/>
      <Representation id="v720" bandwidth="2000000" width="1280" height="720" frameRate="30000/1001"/>
      <Representation id="v480" bandwidth="900000" width="854" height="480"/>
    </AdaptationSet>
    <AdaptationSet contentType="audio" mimeType="audio/mp4" lang="en">
      <SegmentTemplate timescale="1000" duration="2000" media="$RepresentationID$/$Number$.m4s"/>
      <Representation id="en-128" bandwidth="128000"/>
    </AdaptationSet>
    <AdaptationSet contentType="audio" mimeType="audio/mp4" lang="ja">
      <SegmentTemplate timescale="1000" duration="2000" media="$RepresentationID$/$Number$.m4s"/>
      <Representation id="ja-96" bandwidth="96000"/>
    </AdaptationSet>
  </Period>
</MPD>
"#;

#[tokio::test]
async fn representations_are_named_by_quality() -> anyhow::Result<()> {
    init_tracing();
    let server = MockServer::start().await;
    server.mock_manifest("/vod/manifest.mpd", MULTI_AUDIO).await;

    let url = Url::parse(&format!("{}/vod/manifest.mpd", server.uri()))?;
    let variants = parse_dash_variants(
        &HttpClient::default(),
        &url,
        DashParams::default(),
        StreamOptions::default(),
        &VariantOptions::default(),
    )
    .await?;

    // only the first listed language is kept without a selection
    assert_eq!(
        variants.keys().collect::<Vec<_>>(),
        ["1080p60", "480p", "720p", "best", "worst"]
    );
    let best = &variants["best"];
    assert_eq!(best.video().map(|rep| rep.id.as_str()), Some("v1080"));
    assert_eq!(best.audio().map(|rep| rep.id.as_str()), Some("en-128"));
    assert_eq!(
        variants["worst"].video().map(|rep| rep.id.as_str()),
        Some("v480")
    );

    Ok(())
}

#[tokio::test]
async fn every_selected_language_is_a_variant() -> anyhow::Result<()> {
    init_tracing();
    let server = MockServer::start().await;
    server.mock_manifest("/vod/manifest.mpd", MULTI_AUDIO).await;

    let url = Url::parse(&format!("{}/vod/manifest.mpd", server.uri()))?;
    let params = DashParams {
        audio_select: vec!["*".to_string()],
        ..Default::default()
    };
    let variants = parse_dash_variants(
        &HttpClient::default(),
        &url,
        params,
        StreamOptions::default(),
        &VariantOptions::default(),
    )
    .await?;

    assert!(variants.contains_key("720p+a128k"));
    assert!(variants.contains_key("720p+a96k"));
    assert_eq!(
        variants["480p+a96k"].audio().map(|rep| rep.id.as_str()),
        Some("ja-96")
    );

    Ok(())
}

#[tokio::test]
async fn manifest_type_is_detected() -> anyhow::Result<()> {
    init_tracing();
    let server = MockServer::start().await;
    // no extension, detected through the content type
    server.mock_manifest("/vod/manifest", MULTI_AUDIO).await;

    let url = Url::parse(&format!("{}/vod/manifest", server.uri()))?;
    let variants = parse_variants(
        &HttpClient::default(),
        &url,
        HlsParams::default(),
        DashParams::default(),
        StreamOptions::default(),
        &VariantOptions::default(),
    )
    .await?;

    assert_eq!(variants.len(), 5);
    assert!(matches!(variants["best"], StreamVariant::Dash(_)));

    Ok(())
}
