use std::time::Duration;

use reqwest::Url;
use tokio::time::Instant;

use crate::{
    error::{NagareError, NagareResult},
    hls::m3u8::{HlsSegment, KeyMethod, MediaPlaylist, Playlist},
    options::{HlsParams, PlaylistReloadTime, RetryPolicy},
    stream::segmented::{SegmentedWorker, WorkerContext},
    util::http::HttpClient,
};

const MIN_RELOAD_TIME: Duration = Duration::from_secs(1);
const MIN_QUEUE_THRESHOLD: Duration = Duration::from_secs(5);

/// Fetches and parses a playlist without retrying.
async fn fetch_playlist(
    client: &HttpClient,
    url: &Url,
    policy: &RetryPolicy,
) -> NagareResult<(Url, Playlist)> {
    let response = client.fetch(url, None, policy).await?;
    let final_url = response.url().clone();
    let text = response.text().await?;
    let playlist = Playlist::parse(&text, &final_url)?;
    Ok((final_url, playlist))
}

/// Loads a playlist, retrying failed requests and unparsable responses up to
/// `policy.attempts` times.
pub async fn load_playlist(
    client: &HttpClient,
    url: &Url,
    policy: &RetryPolicy,
) -> NagareResult<(Url, Playlist)> {
    let mut attempt = 0;
    loop {
        match fetch_playlist(client, url, policy).await {
            Ok(result) => return Ok(result),
            Err(e) if attempt + 1 < policy.attempts && !is_permanent(&e) => {
                let delay = policy.delay(attempt);
                tracing::warn!(
                    %url,
                    attempt = attempt + 1,
                    attempts = policy.attempts,
                    "Failed to load playlist: {e}. Retrying in {delay:?}"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

fn is_permanent(error: &NagareError) -> bool {
    matches!(error, NagareError::HttpError { status, .. } if status.is_client_error() && status.as_u16() != 429)
}

/// Index of the newest segment whose successors last at least `seconds`.
/// Falls back to the first segment if the playlist is shorter.
pub fn index_from_end(segments: &[HlsSegment], seconds: f64) -> usize {
    let mut elapsed = 0.;
    let mut index = 0;
    for (i, segment) in segments.iter().enumerate().rev() {
        if elapsed >= seconds {
            return i;
        }
        elapsed += segment.duration;
        index = i;
    }
    index
}

/// Index of the first segment starting at or after `seconds`.
/// Falls back to the last segment if the playlist is shorter.
pub fn index_from_start(segments: &[HlsSegment], seconds: f64) -> usize {
    let mut elapsed = 0.;
    for (i, segment) in segments.iter().enumerate() {
        if elapsed >= seconds {
            return i;
        }
        elapsed += segment.duration;
    }
    segments.len().saturating_sub(1)
}

/// Index of the first segment to yield from the initial playlist.
pub fn start_index(playlist: &MediaPlaylist, params: &HlsParams) -> usize {
    let segments = &playlist.segments;
    if segments.is_empty() {
        return 0;
    }

    if playlist.is_live() {
        if params.live_restart {
            return 0;
        }
        if let Some(offset) = params.start_offset.filter(|offset| *offset != 0.) {
            // offsets of live streams always count back from the live edge
            return index_from_end(segments, offset.abs());
        }
        let edge = f64::from(params.live_edge.max(1) - 1) * playlist.target_duration;
        index_from_end(segments, edge)
    } else {
        match params.start_offset {
            Some(offset) if offset > 0. => index_from_start(segments, offset),
            _ => 0,
        }
    }
}

/// Interval between two playlist loads.
pub fn reload_interval(playlist: &MediaPlaylist, params: &HlsParams) -> Duration {
    let segments = &playlist.segments;
    let live_edge_duration = || {
        let count = (params.live_edge.max(2) - 1) as usize;
        segments
            .iter()
            .rev()
            .take(count)
            .map(|s| s.duration)
            .sum::<f64>()
    };

    let seconds = match params.playlist_reload_time {
        PlaylistReloadTime::Segment if !segments.is_empty() => {
            segments.last().map_or(0., |s| s.duration)
        }
        PlaylistReloadTime::LiveEdge if !segments.is_empty() => live_edge_duration(),
        PlaylistReloadTime::Fixed(seconds) if seconds > 0. => seconds,
        _ if playlist.target_duration > 0. => playlist.target_duration,
        _ if !segments.is_empty() => live_edge_duration(),
        _ => 6.,
    };
    Duration::try_from_secs_f64(seconds)
        .unwrap_or(MIN_RELOAD_TIME)
        .max(MIN_RELOAD_TIME)
}

/// Time without new segments after which a live stream is considered over.
pub fn queue_threshold(playlist: &MediaPlaylist, params: &HlsParams) -> Option<Duration> {
    if params.segment_queue_threshold <= 0. {
        return None;
    }
    let seconds = params.segment_queue_threshold * playlist.target_duration;
    Some(
        Duration::try_from_secs_f64(seconds)
            .unwrap_or(MIN_QUEUE_THRESHOLD)
            .max(MIN_QUEUE_THRESHOLD),
    )
}

/// Rejects encryption methods that cannot be decrypted.
pub fn check_encryption(playlist: &MediaPlaylist) -> NagareResult<()> {
    let unsupported = playlist.segments.iter().find_map(|segment| {
        segment.key.as_ref().filter(|key| {
            key.method != KeyMethod::Aes128 || !key.is_identity_format() || key.uri.is_none()
        })
    });
    match unsupported {
        Some(key) => Err(NagareError::UnsupportedEncryption(match &key.method {
            KeyMethod::Aes128 => format!(
                "AES-128 with key format {}",
                key.key_format.as_deref().unwrap_or("identity")
            ),
            KeyMethod::SampleAes => "SAMPLE-AES".to_string(),
            KeyMethod::Other(method) => method.clone(),
            KeyMethod::None => "NONE".to_string(),
        })),
        None => Ok(()),
    }
}

/// Follows a media playlist, yielding its segments and reloading it while it
/// is live.
pub struct HlsWorker {
    client: HttpClient,
    url: Url,
    params: HlsParams,
    policy: RetryPolicy,
    playlist: MediaPlaylist,
    loaded_at: Instant,
}

impl HlsWorker {
    /// Loads the media playlist at `url`. Errors surface here, before a reader
    /// exists.
    pub async fn load(
        client: HttpClient,
        url: Url,
        params: HlsParams,
        policy: RetryPolicy,
    ) -> NagareResult<Self> {
        let loaded_at = Instant::now();
        let (url, playlist) = load_playlist(&client, &url, &policy).await?;
        Self::new(client, url, playlist.into_media()?, params, policy, loaded_at)
    }

    /// Follows an already loaded media playlist.
    pub fn new(
        client: HttpClient,
        url: Url,
        playlist: MediaPlaylist,
        params: HlsParams,
        policy: RetryPolicy,
        loaded_at: Instant,
    ) -> NagareResult<Self> {
        check_encryption(&playlist)?;

        Ok(Self {
            client,
            url,
            params,
            policy,
            playlist,
            loaded_at,
        })
    }

    pub fn playlist(&self) -> &MediaPlaylist {
        &self.playlist
    }

    async fn reload(&mut self) -> NagareResult<MediaPlaylist> {
        let (url, playlist) = load_playlist(&self.client, &self.url, &self.policy)
            .await
            .map_err(|e| {
                tracing::error!(url = %self.url, "Failed to reload playlist: {e}");
                NagareError::PlaylistReloadFailed(self.policy.attempts)
            })?;
        self.url = url;
        playlist
            .into_media()
            .map_err(|_| NagareError::PlaylistReloadFailed(self.policy.attempts))
    }
}

impl SegmentedWorker for HlsWorker {
    type Segment = HlsSegment;

    async fn run(mut self, ctx: WorkerContext<HlsSegment>) -> NagareResult<()> {
        let mut playlist = std::mem::take(&mut self.playlist);
        let mut before_load = self.loaded_at;

        tracing::info!(
            live = playlist.is_live(),
            first = playlist.segments.first().map(|s| s.sequence),
            last = playlist.last_sequence(),
            "Loaded playlist"
        );

        let mut next_index = start_index(&playlist, &self.params);
        if let Some(segment) = playlist.segments.get(next_index) {
            tracing::debug!(sequence = segment.sequence, "Starting");
        }
        let mut last_sequence: Option<u64> = None;
        let mut last_queued = Instant::now();
        let mut yielded = 0.;

        loop {
            for segment in &playlist.segments[next_index.min(playlist.segments.len())..] {
                if let Some(limit) = self.params.duration {
                    if yielded >= limit.as_secs_f64() {
                        tracing::info!("Stopping stream early after {limit:?}");
                        return Ok(());
                    }
                }

                if !ctx.put(segment.clone()).await {
                    return Ok(());
                }
                yielded += segment.duration;
                last_sequence = Some(segment.sequence);
                last_queued = Instant::now();
            }

            if playlist.end_list {
                tracing::debug!("Reached end of playlist");
                return Ok(());
            }

            if let Some(threshold) = queue_threshold(&playlist, &self.params) {
                let elapsed = last_queued.elapsed();
                if elapsed >= threshold {
                    tracing::warn!(
                        "No new segments in playlist for more than {:.2}s. Stopping...",
                        threshold.as_secs_f64()
                    );
                    return Err(NagareError::StreamStalled(elapsed.as_secs_f64()));
                }
            }

            let reload_time = reload_interval(&playlist, &self.params);
            tracing::debug!("Reloading playlist in {reload_time:?}");
            if ctx.wait_until(before_load + reload_time).await {
                return Ok(());
            }
            if !ctx.wait_free().await {
                return Ok(());
            }

            before_load = Instant::now();
            playlist = match ctx.or_closed(self.reload()).await {
                Some(result) => result?,
                None => return Ok(()),
            };
            next_index = self.next_index(&playlist, last_sequence);
        }
    }
}

impl HlsWorker {
    /// Position in a reloaded playlist right after `last_sequence`.
    fn next_index(&self, playlist: &MediaPlaylist, last_sequence: Option<u64>) -> usize {
        let Some(last) = last_sequence else {
            return start_index(playlist, &self.params);
        };
        let Some(newest) = playlist.last_sequence() else {
            return 0;
        };

        if newest < last {
            tracing::warn!(
                last,
                newest,
                "Playlist sequence went backwards, restarting from the live edge"
            );
            return start_index(playlist, &self.params);
        }

        let index = playlist
            .segments
            .iter()
            .position(|s| s.sequence > last)
            .unwrap_or(playlist.segments.len());
        if let Some(first_new) = playlist.segments.get(index) {
            if first_new.sequence > last + 1 {
                tracing::warn!(
                    "Skipped segments {}-{} after playlist reload. \
                     This is unsupported and will result in incoherent output data.",
                    last + 1,
                    first_new.sequence - 1
                );
            }
        }
        index
    }
}
