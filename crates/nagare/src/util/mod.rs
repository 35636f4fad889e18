use http::HttpClient;
use reqwest::Url;

use crate::{error::NagareResult, hls::m3u8};

pub mod http;
pub mod ordered_stream;
pub mod quality;
pub mod range;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestType {
    Hls,
    Dash,
}

pub async fn detect_manifest_type(url: &Url, client: &HttpClient) -> NagareResult<ManifestType> {
    // 1. check extension
    let path = url.path().to_lowercase();
    if path.ends_with(".m3u8") || path.ends_with(".m3u") {
        return Ok(ManifestType::Hls);
    } else if path.ends_with(".mpd") {
        return Ok(ManifestType::Dash);
    }

    // 2. check content type
    let response = client.request(url.clone()).send().await?;
    let content_type = response
        .headers()
        .get("content-type")
        .and_then(|s| s.to_str().ok())
        .map(|r| r.to_lowercase());
    match content_type.as_deref().map(|c| c.split(';').next().unwrap_or(c).trim()) {
        Some("application/x-mpegurl" | "application/vnd.apple.mpegurl" | "audio/mpegurl") => {
            return Ok(ManifestType::Hls)
        }
        Some("application/dash+xml") => return Ok(ManifestType::Dash),
        _ => {}
    }

    // 3. check by parsing
    let body = response.text().await.unwrap_or_default();
    if m3u8::Playlist::parse(&body, url).is_ok() {
        return Ok(ManifestType::Hls);
    }

    Ok(ManifestType::Dash)
}
