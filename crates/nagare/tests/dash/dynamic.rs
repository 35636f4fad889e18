use chrono::{SecondsFormat, TimeDelta, Utc};
use nagare::{open_dash, DashParams, HttpClient, StreamOptions};
use reqwest::Url;
use tokio::time::timeout;
use wiremock::MockServer;

use super::DashMock;
use crate::{body, init_tracing, read_at_least, single, TIMEOUT};

#[tokio::test]
async fn dynamic_timeline_waits_for_availability() -> anyhow::Result<()> {
    init_tracing();
    let server = MockServer::start().await;

    // the first segment is available, the others follow every 500ms
    let start = Utc::now() - TimeDelta::milliseconds(750);
    let mpd = format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<MPD xmlns="urn:mpeg:dash:schema:mpd:2011" type="dynamic" availabilityStartTime="{}" minimumUpdatePeriod="PT1S" minBufferTime="PT1S">
  <Period id="live" start="PT0S">
    <AdaptationSet contentType="video" mimeType="video/mp4">
      <SegmentTemplate timescale="1000" media="t-$Time$.m4s" initialization="init.m4s">
        <SegmentTimeline>
          <S t="0" d="500" r="4"/>
        </SegmentTimeline>
      </SegmentTemplate>
      <Representation id="v" bandwidth="500000" height="360"/>
    </AdaptationSet>
  </Period>
</MPD>"#,
        start.to_rfc3339_opts(SecondsFormat::Millis, true)
    );
    server.mock_manifest("/live/manifest.mpd", &mpd).await;

    let init = body("init;", 100);
    server.mock("/live/init.m4s", init.clone()).await;
    let segments: Vec<_> = (0..5).map(|i| body(&format!("t{i};"), 200 + i * 50)).collect();
    for (i, data) in segments.iter().enumerate() {
        server
            .mock(&format!("/live/t-{}.m4s", i * 500), data.clone())
            .await;
    }

    // start from the first segment even if a few became available meanwhile
    let params = DashParams {
        live_edge: 5,
        ..Default::default()
    };
    let url = Url::parse(&format!("{}/live/manifest.mpd", server.uri()))?;
    let reader = single(
        open_dash(&HttpClient::default(), &url, params, StreamOptions::default(), None, None)
            .await?,
    )?;

    // record when the end of every segment arrived
    let mut ends = Vec::new();
    let mut end = init.len();
    for data in &segments {
        end += data.len();
        ends.push(end);
    }
    let mut received = Vec::new();
    let mut arrivals = Vec::new();
    let mut buf = [0u8; 4096];
    timeout(TIMEOUT, async {
        while received.len() < end {
            let n = reader.read_async(&mut buf).await;
            if n == 0 {
                break;
            }
            received.extend_from_slice(&buf[..n]);
            let now = Utc::now();
            while arrivals.len() < ends.len() && received.len() >= ends[arrivals.len()] {
                arrivals.push(now);
            }
        }
    })
    .await?;

    let expected: Vec<u8> = std::iter::once(&init)
        .chain(&segments)
        .flatten()
        .copied()
        .collect();
    assert_eq!(received, expected);
    for (i, arrival) in arrivals.iter().enumerate() {
        let available_at = start + TimeDelta::milliseconds(500 * (i as i64 + 1));
        assert!(
            *arrival >= available_at - TimeDelta::milliseconds(20),
            "segment {i} arrived at {arrival}, available at {available_at}"
        );
    }
    assert!(reader.shutdown().await);

    Ok(())
}

#[tokio::test]
async fn dynamic_number_template_starts_at_live_edge() -> anyhow::Result<()> {
    init_tracing();
    let server = MockServer::start().await;

    // 100 two-second segments have been published, the 101st is in progress
    let start = Utc::now() - TimeDelta::milliseconds(200_500);
    let mpd = format!(
        r#"<MPD type="dynamic" availabilityStartTime="{}" minimumUpdatePeriod="PT2S" timeShiftBufferDepth="PT30S">
  <Period start="PT0S">
    <AdaptationSet mimeType="audio/mp4" lang="en">
      <SegmentTemplate timescale="1" duration="2" startNumber="1" media="a-$Number%05d$.m4s"/>
      <Representation id="a" bandwidth="64000"/>
    </AdaptationSet>
  </Period>
</MPD>"#,
        start.to_rfc3339_opts(SecondsFormat::Millis, true)
    );
    server.mock_manifest("/edge/manifest.mpd", &mpd).await;
    for number in 80..=110 {
        server
            .mock(&format!("/edge/a-{number:05}.m4s"), body(&format!("{number};"), 300))
            .await;
    }

    let url = Url::parse(&format!("{}/edge/manifest.mpd", server.uri()))?;
    let reader = single(
        open_dash(&HttpClient::default(), &url, DashParams::default(), StreamOptions::default(), None, None)
            .await?,
    )?;

    // the third newest available segment, 100 being the newest
    let data = timeout(TIMEOUT, read_at_least(&reader, 300)).await?;
    assert_eq!(&data[..300], body("98;", 300).as_slice());
    assert!(reader.shutdown().await);

    Ok(())
}
