use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::Url;

use crate::{
    dash::{
        clock::Clock,
        mpd::{Mpd, RepresentationRef},
        timeline::{self, DashSegment},
    },
    error::{NagareError, NagareResult},
    options::{DashParams, RetryPolicy},
    stream::segmented::{SegmentedWorker, WorkerContext},
    util::http::HttpClient,
};

const RELOAD_BACKOFF: f64 = 1.3;
const RELOAD_BACKOFF_MAX: f64 = 10.;
const MAX_RELOAD_TIME: Duration = Duration::from_secs(3600);

/// Fetches and parses a manifest. Requests are retried per `policy`, an
/// unparsable manifest is not.
pub async fn load_manifest(
    client: &HttpClient,
    url: &Url,
    policy: &RetryPolicy,
) -> NagareResult<(Url, Mpd)> {
    let (url, text) = client.get_text(url, policy).await?;
    let mpd = Mpd::parse(&text, &url)?;
    Ok((url, mpd))
}

/// Index of the first segment to yield when joining a live presentation:
/// `live_edge` segments behind the newest available one.
pub fn live_edge_index(segments: &[DashSegment], now: DateTime<Utc>, live_edge: u32) -> usize {
    let available = segments
        .iter()
        .take_while(|s| s.available_at.map_or(true, |at| at <= now))
        .count();
    available.saturating_sub(live_edge as usize)
}

/// Time until the next manifest reload, capped at [`MAX_RELOAD_TIME`].
pub fn reload_time(update_period: f64, backoff: f64) -> Duration {
    Duration::try_from_secs_f64(update_period * backoff)
        .unwrap_or(MAX_RELOAD_TIME)
        .min(MAX_RELOAD_TIME)
}

/// Yields the segments of one representation, refreshing the manifest while
/// the presentation is dynamic.
pub struct DashWorker {
    client: HttpClient,
    url: Url,
    mpd: Option<Mpd>,
    reference: RepresentationRef,
    params: DashParams,
    policy: RetryPolicy,
    clock: Clock,
}

impl DashWorker {
    pub fn new(
        client: HttpClient,
        url: Url,
        mpd: Mpd,
        reference: RepresentationRef,
        params: DashParams,
        policy: RetryPolicy,
        clock: Clock,
    ) -> NagareResult<Self> {
        mpd.find(&reference)?;
        Ok(Self {
            client,
            url,
            mpd: Some(mpd),
            reference,
            params,
            policy,
            clock,
        })
    }

    async fn reload(&mut self) -> NagareResult<Mpd> {
        let (url, mpd) = load_manifest(&self.client, &self.url, &self.policy)
            .await
            .map_err(|e| {
                tracing::error!(url = %self.url, "Failed to reload manifest: {e}");
                NagareError::PlaylistReloadFailed(self.policy.attempts)
            })?;
        self.url = url;
        self.clock
            .sync(&mpd.utc_timing, &self.client, &self.policy)
            .await;
        Ok(mpd)
    }
}

impl SegmentedWorker for DashWorker {
    type Segment = DashSegment;

    async fn run(mut self, ctx: WorkerContext<DashSegment>) -> NagareResult<()> {
        let Some(mut mpd) = self.mpd.take() else {
            return Ok(());
        };
        tracing::info!(
            representation = %self.reference.id,
            dynamic = mpd.is_dynamic(),
            "Loaded manifest"
        );

        let mut init_sent = false;
        let mut last_position: Option<u64> = None;
        let mut yielded = 0.;
        let mut backoff = 1.;

        loop {
            let (period, representation) = mpd.find(&self.reference)?;
            let now = self.clock.now();
            let (init, media): (Vec<_>, Vec<_>) =
                timeline::segments(&mpd, period, representation, now)?
                    .into_iter()
                    .partition(|s| s.init);

            if !init_sent {
                for segment in init {
                    if !ctx.put(segment).await {
                        return Ok(());
                    }
                }
                init_sent = true;
            }

            let start = match last_position {
                Some(last) => media
                    .iter()
                    .position(|s| s.position() > last)
                    .unwrap_or(media.len()),
                None if mpd.is_dynamic() => {
                    let index = live_edge_index(&media, now, self.params.live_edge);
                    if let Some(segment) = media.get(index) {
                        tracing::debug!(number = segment.number, "Starting at live edge");
                    }
                    index
                }
                None => 0,
            };

            let mut new_segments = false;
            for segment in &media[start..] {
                if let Some(limit) = self.params.duration {
                    if yielded >= limit.as_secs_f64() {
                        tracing::info!("Stopping stream early after {limit:?}");
                        return Ok(());
                    }
                }

                if let Some(available_at) = segment.available_at {
                    let delay = (available_at - self.clock.now())
                        .to_std()
                        .unwrap_or_default();
                    if !delay.is_zero() {
                        tracing::trace!(number = segment.number, "Waiting {delay:?} for segment");
                        if ctx.wait(delay).await {
                            return Ok(());
                        }
                    }
                }

                if !ctx.put(segment.clone()).await {
                    return Ok(());
                }
                yielded += segment.duration;
                last_position = Some(segment.position());
                new_segments = true;
            }

            if !mpd.is_dynamic() {
                tracing::debug!("Reached end of presentation");
                return Ok(());
            }

            // an update without new segments backs off until the timeline moves again
            backoff = if new_segments {
                1.
            } else {
                (backoff * RELOAD_BACKOFF).min(RELOAD_BACKOFF_MAX)
            };
            let segment_duration = media
                .last()
                .map(|s| s.duration)
                .filter(|d| *d > 0.)
                .unwrap_or(1.);
            let update_period = mpd
                .minimum_update_period
                .map(|d| d.as_secs_f64())
                .unwrap_or_default()
                .max(segment_duration);
            let reload_time = reload_time(update_period, backoff);

            tracing::debug!("Reloading manifest in {reload_time:?}");
            if ctx.wait(reload_time).await {
                return Ok(());
            }
            if !ctx.wait_free().await {
                return Ok(());
            }
            mpd = match ctx.or_closed(self.reload()).await {
                Some(result) => result?,
                None => return Ok(()),
            };
        }
    }
}
