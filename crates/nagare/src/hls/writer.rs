use std::sync::{Mutex, PoisonError};

use bytes::Bytes;
use regex::Regex;
use reqwest::Url;

use crate::{
    decrypt::{sequence_iv, Aes128Key, KeyCache, StreamDecryptor},
    error::{NagareError, NagareResult},
    fetch::{fetch_segment, write_body, write_chunk, SegmentBody},
    hls::m3u8::{HlsSegment, Key, KeyMethod, Map},
    options::{HlsParams, RetryPolicy, SegmentFilter},
    ringbuffer::RingBuffer,
    stream::segmented::SegmentedWriter,
    util::http::HttpClient,
};

pub struct FetchedSegment {
    map: Option<(Map, Bytes)>,
    body: SegmentBody,
    decryptor: Option<StreamDecryptor>,
}

/// Downloads, filters and decrypts HLS segments.
///
/// A configured key URI override is a template where `{url}`, `{scheme}`,
/// `{netloc}`, `{path}` and `{query}` are replaced by the parts of the key URI
/// declared in the playlist.
pub struct HlsSegmentWriter {
    client: HttpClient,
    policy: RetryPolicy,
    keys: KeyCache,
    key_uri_override: Option<String>,
    ignore_names: Option<Regex>,
    filter: Option<SegmentFilter>,
    stream_data: bool,

    map_cache: tokio::sync::Mutex<Option<(Map, Bytes)>>,
    written_map: Mutex<Option<Map>>,

    // seconds of consecutively skipped media and the limit for it
    skipped: Mutex<f64>,
    skip_limit: Option<f64>,
}

impl HlsSegmentWriter {
    pub fn new(
        client: HttpClient,
        params: &HlsParams,
        policy: RetryPolicy,
        target_duration: f64,
    ) -> NagareResult<Self> {
        let ignore_names = if params.segment_ignore_names.is_empty() {
            None
        } else {
            let names = params
                .segment_ignore_names
                .iter()
                .map(|name| regex::escape(name))
                .collect::<Vec<_>>()
                .join("|");
            Some(Regex::new(&format!(r"(?i)(?:^|/)(?:{names})\.\w+$"))?)
        };
        let skip_limit = (params.segment_queue_threshold > 0. && target_duration > 0.)
            .then(|| params.segment_queue_threshold * target_duration);

        Ok(Self {
            keys: KeyCache::new(client.clone(), policy),
            client,
            policy,
            key_uri_override: params.segment_key_uri.clone(),
            ignore_names,
            filter: params.segment_filter.clone(),
            stream_data: params.segment_stream_data,
            map_cache: tokio::sync::Mutex::new(None),
            written_map: Mutex::new(None),
            skipped: Mutex::new(0.),
            skip_limit,
        })
    }

    fn is_filtered(&self, segment: &HlsSegment) -> bool {
        let ignored = self
            .ignore_names
            .as_ref()
            .is_some_and(|names| names.is_match(segment.uri.path()));
        ignored || self.filter.as_ref().is_some_and(|f| f.matches(segment))
    }

    fn key_uri(&self, uri: &Url) -> NagareResult<Url> {
        let Some(template) = &self.key_uri_override else {
            return Ok(uri.clone());
        };
        Ok(Url::parse(&format_key_uri(template, uri))?)
    }

    async fn key(&self, key: &Key, sequence: u64) -> NagareResult<Aes128Key> {
        if key.method != KeyMethod::Aes128 || !key.is_identity_format() {
            return Err(NagareError::UnsupportedEncryption(format!(
                "{:?} ({})",
                key.method,
                key.key_format.as_deref().unwrap_or("identity")
            )));
        }
        let uri = key.uri.as_ref().ok_or_else(|| {
            NagareError::UnsupportedEncryption("AES-128 key without URI".to_string())
        })?;
        let key_bytes = self.keys.get(&self.key_uri(uri)?).await?;
        let iv = key.iv.unwrap_or_else(|| sequence_iv(sequence));
        Aes128Key::new(&key_bytes, iv)
    }

    async fn map(&self, map: &Map) -> NagareResult<Bytes> {
        let mut cache = self.map_cache.lock().await;
        if let Some((cached, bytes)) = cache.as_ref() {
            if cached == map {
                return Ok(bytes.clone());
            }
        }
        let bytes = self
            .client
            .get_bytes(&map.uri, map.byte_range.as_ref(), &self.policy)
            .await?;
        *cache = Some((map.clone(), bytes.clone()));
        Ok(bytes)
    }
}

/// Expands a key URI override template.
pub fn format_key_uri(template: &str, uri: &Url) -> String {
    let netloc = match (uri.host_str(), uri.port()) {
        (Some(host), Some(port)) => format!("{host}:{port}"),
        (Some(host), None) => host.to_string(),
        _ => String::new(),
    };
    template
        .replace("{url}", uri.as_str())
        .replace("{scheme}", uri.scheme())
        .replace("{netloc}", &netloc)
        .replace("{path}", uri.path())
        .replace("{query}", uri.query().unwrap_or_default())
}

impl SegmentedWriter for HlsSegmentWriter {
    type Segment = HlsSegment;
    type Fetched = FetchedSegment;

    async fn fetch(&self, segment: &HlsSegment) -> NagareResult<Option<FetchedSegment>> {
        if segment.gap {
            tracing::debug!(sequence = segment.sequence, "Skipping gap segment");
            return Ok(None);
        }
        if self.is_filtered(segment) {
            tracing::debug!(sequence = segment.sequence, "Filtering out segment");
            return Ok(None);
        }

        let key = match &segment.key {
            Some(key) => Some(self.key(key, segment.sequence).await?),
            None => None,
        };
        let map = match &segment.map {
            Some(map) => Some((map.clone(), self.map(map).await?)),
            None => None,
        };
        let body = fetch_segment(
            &self.client,
            &segment.uri,
            segment.byte_range.as_ref(),
            &self.policy,
            self.stream_data,
        )
        .await?;

        let (body, decryptor) = match (key, body) {
            (Some(key), SegmentBody::Complete(data)) => {
                let plain = key.decrypt(&data).inspect_err(|e| {
                    tracing::error!(sequence = segment.sequence, "Failed to decrypt segment: {e}")
                })?;
                (SegmentBody::Complete(Bytes::from(plain)), None)
            }
            (Some(key), body) => (body, Some(key.decryptor())),
            (None, body) => (body, None),
        };

        Ok(Some(FetchedSegment {
            map,
            body,
            decryptor,
        }))
    }

    async fn write(
        &self,
        segment: &HlsSegment,
        fetched: FetchedSegment,
        buffer: &RingBuffer,
    ) -> NagareResult<()> {
        if let Some((map, bytes)) = fetched.map {
            let changed = self
                .written_map
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .as_ref()
                != Some(&map);
            if changed {
                tracing::debug!(uri = %map.uri, "Writing init section");
                if !write_chunk(buffer, &bytes).await {
                    return Ok(());
                }
                *self
                    .written_map
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner) = Some(map);
            }
        }

        // In stream-data mode bytes may already be out when the body fails, so
        // the rest of the segment is dropped rather than failing the stream.
        match write_body(fetched.body, fetched.decryptor, buffer).await {
            Ok(written) => {
                tracing::trace!(sequence = segment.sequence, written, "Segment written");
                *self.skipped.lock().unwrap_or_else(PoisonError::into_inner) = 0.;
                Ok(())
            }
            Err(e) => {
                tracing::error!(sequence = segment.sequence, "Failed to write segment: {e}");
                self.count_skipped(segment)
            }
        }
    }

    async fn on_skip(&self, segment: &HlsSegment, _error: &NagareError) -> NagareResult<()> {
        self.count_skipped(segment)
    }
}

impl HlsSegmentWriter {
    /// Adds `segment` to the media lost in a row, failing once it exceeds the
    /// queue threshold.
    fn count_skipped(&self, segment: &HlsSegment) -> NagareResult<()> {
        let mut skipped = self.skipped.lock().unwrap_or_else(PoisonError::into_inner);
        *skipped += segment.duration;
        match self.skip_limit {
            Some(limit) if *skipped > limit => Err(NagareError::StreamStalled(*skipped)),
            _ => Ok(()),
        }
    }
}
