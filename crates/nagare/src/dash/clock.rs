use chrono::{DateTime, TimeDelta, Utc};
use reqwest::{header::DATE, Url};

use crate::{
    dash::{duration::parse_datetime, mpd::UtcTiming},
    error::{NagareError, NagareResult},
    options::RetryPolicy,
    util::http::HttpClient,
};

/// Wall clock of a dynamic presentation, synchronised with the server through
/// the manifest's `UTCTiming` elements.
#[derive(Debug, Clone, Default)]
pub struct Clock {
    /// How much the local clock is behind the remote clock
    offset: TimeDelta,
}

impl Clock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn now(&self) -> DateTime<Utc> {
        Utc::now() + self.offset
    }

    pub fn offset(&self) -> TimeDelta {
        self.offset
    }

    fn set_time(
        &mut self,
        remote_now: DateTime<Utc>,
        before_request: DateTime<Utc>,
        after_request: DateTime<Utc>,
    ) {
        // the remote time was taken about half a round trip before the response arrived
        let rtt = after_request - before_request;
        self.offset = remote_now + rtt / 2 - after_request;
        tracing::info!(
            offset_milliseconds = self.offset.num_milliseconds(),
            "Clock time set to {remote_now}"
        );
    }

    /// Tries every timing source in order. When none of them works the local
    /// clock is used.
    pub async fn sync(&mut self, timings: &[UtcTiming], client: &HttpClient, policy: &RetryPolicy) {
        if timings.is_empty() {
            tracing::debug!("No UTCTiming elements found in MPD, using local time");
            return;
        }

        for timing in timings {
            tracing::debug!(scheme = %timing.scheme_id_uri, value = ?timing.value, "Synchronizing clock");
            match self.sync_with(timing, client, policy).await {
                Ok(()) => return,
                Err(e) => {
                    tracing::warn!(scheme = %timing.scheme_id_uri, "Failed to synchronize clock: {e}")
                }
            }
        }
        tracing::warn!("All time sync methods failed, using local time");
        self.offset = TimeDelta::zero();
    }

    async fn sync_with(
        &mut self,
        timing: &UtcTiming,
        client: &HttpClient,
        policy: &RetryPolicy,
    ) -> NagareResult<()> {
        let value = timing.value.as_deref().ok_or_else(|| {
            NagareError::InvalidTimingSchema(format!("missing value for {}", timing.scheme_id_uri))
        })?;

        match timing.scheme_id_uri.as_str() {
            "urn:mpeg:dash:utc:direct:2014" => {
                let now = Utc::now();
                self.set_time(parse_datetime(value)?, now, now);
            }
            "urn:mpeg:dash:utc:http-xsdate:2014" | "urn:mpeg:dash:utc:http-iso:2014" => {
                let url = Url::parse(value)?;
                let before_request = Utc::now();
                let (_, text) = client.get_text(&url, policy).await?;
                let after_request = Utc::now();
                self.set_time(parse_datetime(&text)?, before_request, after_request);
            }
            "urn:mpeg:dash:utc:http-head:2014" => {
                let before_request = Utc::now();
                let response = client.head(value).timeout(policy.timeout).send().await?;
                let after_request = Utc::now();
                if !response.status().is_success() {
                    return Err(NagareError::http(response.status(), value));
                }
                let date = response
                    .headers()
                    .get(DATE)
                    .and_then(|date| date.to_str().ok())
                    .and_then(|date| DateTime::parse_from_rfc2822(date).ok())
                    .ok_or_else(|| {
                        NagareError::InvalidTimingSchema("missing Date header".to_string())
                    })?;
                self.set_time(date.with_timezone(&Utc), before_request, after_request);
            }
            others => {
                return Err(NagareError::InvalidTimingSchema(format!(
                    "unsupported scheme {others}"
                )))
            }
        }
        Ok(())
    }
}
