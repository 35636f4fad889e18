//! Option records consumed by the streaming core.
//!
//! Every record implements [`Default`] with the documented defaults and
//! [`serde::Deserialize`] so that an outer configuration layer can produce it.
//! Durations are expressed in (fractional) seconds on the wire.

use std::{collections::HashMap, fmt, str::FromStr, sync::Arc, time::Duration};

use serde::{Deserialize, Deserializer};

use crate::hls::HlsSegment;

/// Settings shared by every segmented stream.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct StreamOptions {
    /// Capacity of the ring buffer between writer and reader, in bytes.
    pub ringbuffer_size: usize,
    /// How many times a segment fetch is attempted before it is skipped.
    pub segment_attempts: u32,
    /// Number of segments fetched concurrently.
    pub segment_threads: usize,
    #[serde(deserialize_with = "seconds")]
    pub segment_timeout: Duration,
    /// Timeout of manifest requests.
    #[serde(deserialize_with = "seconds")]
    pub stream_timeout: Duration,
    /// Base delay of the exponential retry backoff.
    #[serde(deserialize_with = "seconds")]
    pub retry_backoff: Duration,
    /// Upper bound of a single backoff delay.
    #[serde(deserialize_with = "seconds")]
    pub retry_backoff_max: Duration,
    /// How long a closed stream waits for its tasks before abandoning them.
    #[serde(deserialize_with = "seconds")]
    pub close_grace: Duration,
    /// Extra headers sent with every manifest, key and segment request.
    pub headers: HashMap<String, String>,
    /// Extra query parameters appended to every request.
    pub params: HashMap<String, String>,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            ringbuffer_size: 16 * 1024 * 1024,
            segment_attempts: 3,
            segment_threads: 1,
            segment_timeout: Duration::from_secs(10),
            stream_timeout: Duration::from_secs(60),
            retry_backoff: Duration::from_millis(500),
            retry_backoff_max: Duration::from_secs(10),
            close_grace: Duration::from_secs(5),
            headers: HashMap::new(),
            params: HashMap::new(),
        }
    }
}

impl StreamOptions {
    pub fn segment_retry(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.segment_attempts.max(1),
            timeout: self.segment_timeout,
            backoff: self.retry_backoff,
            backoff_max: self.retry_backoff_max,
        }
    }

    pub fn manifest_retry(&self, attempts: u32) -> RetryPolicy {
        RetryPolicy {
            attempts: attempts.max(1),
            timeout: self.stream_timeout,
            backoff: self.retry_backoff,
            backoff_max: self.retry_backoff_max,
        }
    }
}

/// Attempts, per-attempt timeout and exponential backoff of a request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub timeout: Duration,
    pub backoff: Duration,
    pub backoff_max: Duration,
}

impl RetryPolicy {
    /// Delay before the retry following the failed `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(16));
        self.backoff.saturating_mul(factor).min(self.backoff_max)
    }
}

/// How the HLS worker computes the interval between playlist reloads.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum PlaylistReloadTime {
    /// The playlist's target duration.
    #[default]
    Default,
    /// Duration of the last segment.
    Segment,
    /// Sum of the durations of the last `live_edge - 1` segments.
    LiveEdge,
    /// A fixed number of seconds.
    Fixed(f64),
}

impl FromStr for PlaylistReloadTime {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "default" => Ok(Self::Default),
            "segment" => Ok(Self::Segment),
            "live-edge" => Ok(Self::LiveEdge),
            other => other
                .parse::<f64>()
                .ok()
                .filter(|secs| secs.is_finite() && *secs > 0.)
                .map(Self::Fixed)
                .ok_or_else(|| format!("invalid playlist reload time: {other}")),
        }
    }
}

impl<'de> Deserialize<'de> for PlaylistReloadTime {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Seconds(f64),
            Policy(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Seconds(secs) => Ok(Self::Fixed(secs)),
            Raw::Policy(policy) => policy.parse().map_err(serde::de::Error::custom),
        }
    }
}

/// Predicate deciding whether a segment is dropped before it is fetched.
#[derive(Clone)]
pub struct SegmentFilter(pub Arc<dyn Fn(&HlsSegment) -> bool + Send + Sync>);

impl SegmentFilter {
    pub fn new(filter: impl Fn(&HlsSegment) -> bool + Send + Sync + 'static) -> Self {
        Self(Arc::new(filter))
    }

    pub fn matches(&self, segment: &HlsSegment) -> bool {
        (self.0)(segment)
    }
}

impl fmt::Debug for SegmentFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SegmentFilter")
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct HlsParams {
    /// How many target durations behind the live edge playback starts.
    pub live_edge: u32,
    pub playlist_reload_attempts: u32,
    pub playlist_reload_time: PlaylistReloadTime,
    /// Number of target durations without new segments after which a live stream ends.
    /// `0` disables the check.
    pub segment_queue_threshold: f64,
    /// Maximum amount of media time to yield.
    #[serde(deserialize_with = "optional_seconds")]
    pub duration: Option<Duration>,
    /// Start offset in seconds. Negative values count from the live edge.
    pub start_offset: Option<f64>,
    /// Start live streams from the first available segment.
    pub live_restart: bool,
    /// Segment basenames (without extension) that are never fetched.
    pub segment_ignore_names: Vec<String>,
    /// Key URI override, see [`crate::hls::HlsSegmentWriter`].
    pub segment_key_uri: Option<String>,
    /// Languages or names of the audio renditions to select, `*` selects all.
    pub audio_select: Vec<String>,
    /// Write segment data while it is downloaded instead of after completion.
    pub segment_stream_data: bool,
    #[serde(skip)]
    pub segment_filter: Option<SegmentFilter>,
}

impl Default for HlsParams {
    fn default() -> Self {
        Self {
            live_edge: 3,
            playlist_reload_attempts: 3,
            playlist_reload_time: PlaylistReloadTime::Default,
            segment_queue_threshold: 3.,
            duration: None,
            start_offset: None,
            live_restart: false,
            segment_ignore_names: Vec::new(),
            segment_key_uri: None,
            audio_select: Vec::new(),
            segment_stream_data: false,
            segment_filter: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct DashParams {
    pub manifest_reload_attempts: u32,
    /// Number of available segments behind the newest one where live playback starts.
    pub live_edge: u32,
    #[serde(deserialize_with = "optional_seconds")]
    pub duration: Option<Duration>,
    /// Preferred audio languages, `*` keeps every language.
    pub audio_select: Vec<String>,
}

impl Default for DashParams {
    fn default() -> Self {
        Self {
            manifest_reload_attempts: 3,
            live_edge: 3,
            duration: None,
            audio_select: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct VariantOptions {
    /// Expressions like `>720p`, `<=480p` or `1080p60` whose matching streams
    /// are left out of `best` / `worst`.
    pub stream_sorting_excludes: Vec<String>,
}

fn seconds<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let secs = f64::deserialize(deserializer)?;
    Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
}

fn optional_seconds<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<f64>::deserialize(deserializer)?
        .map(Duration::try_from_secs_f64)
        .transpose()
        .map_err(serde::de::Error::custom)
}
