pub mod m3u8;
pub mod variants;
pub mod worker;
pub mod writer;

use std::collections::BTreeMap;

use reqwest::Url;
use tokio::time::Instant;

pub use m3u8::{HlsSegment, Playlist, VariantStream};
pub use worker::HlsWorker;
pub use writer::HlsSegmentWriter;

use crate::{
    error::{NagareError, NagareResult},
    options::{HlsParams, StreamOptions, VariantOptions},
    stream::{segmented::spawn_pipeline, Reader, Stream, StreamOutput},
    util::{http::HttpClient, quality::add_synonyms},
};

/// A named HLS stream: a media playlist, optionally with the variant
/// information and audio renditions it was declared with in a master playlist.
#[derive(Clone)]
pub struct HlsStream {
    client: HttpClient,
    url: Url,
    variant: Option<VariantStream>,
    params: HlsParams,
    options: StreamOptions,
}

impl HlsStream {
    pub fn new(client: HttpClient, url: Url, params: HlsParams, options: StreamOptions) -> Self {
        Self {
            client,
            url,
            variant: None,
            params,
            options,
        }
    }

    pub fn from_variant(
        client: HttpClient,
        variant: VariantStream,
        params: HlsParams,
        options: StreamOptions,
    ) -> Self {
        Self {
            client,
            url: variant.uri.clone(),
            variant: Some(variant),
            params,
            options,
        }
    }

    pub fn variant(&self) -> Option<&VariantStream> {
        self.variant.as_ref()
    }
}

impl Stream for HlsStream {
    fn url(&self) -> &Url {
        &self.url
    }

    async fn open(&self) -> NagareResult<StreamOutput> {
        let video = open_media(&self.client, &self.url, &self.params, &self.options).await?;

        let Some(variant) = &self.variant else {
            return Ok(StreamOutput::Single(video));
        };
        let mut audio = Vec::new();
        for media in variants::select_audio(variant, &self.params.audio_select) {
            let Some(uri) = media.uri.filter(|uri| uri != &self.url) else {
                continue;
            };
            tracing::info!(%uri, language = ?media.language, name = %media.name, "Opening audio rendition");
            audio.push(open_media(&self.client, &uri, &self.params, &self.options).await?);
        }

        if audio.is_empty() {
            Ok(StreamOutput::Single(video))
        } else {
            Ok(StreamOutput::Muxed { video, audio })
        }
    }
}

async fn open_media(
    client: &HttpClient,
    url: &Url,
    params: &HlsParams,
    options: &StreamOptions,
) -> NagareResult<Reader> {
    let policy = options.manifest_retry(params.playlist_reload_attempts);
    let worker = HlsWorker::load(client.clone(), url.clone(), params.clone(), policy).await?;
    spawn(client, worker, params, options)
}

fn spawn(
    client: &HttpClient,
    worker: HlsWorker,
    params: &HlsParams,
    options: &StreamOptions,
) -> NagareResult<Reader> {
    let writer = HlsSegmentWriter::new(
        client.clone(),
        params,
        options.segment_retry(),
        worker.playlist().target_duration,
    )?;
    Ok(spawn_pipeline(worker, writer, options))
}

/// Opens the HLS stream at `url`.
///
/// A master playlist resolves to its best variant. Manifest errors are
/// returned here, before any reader exists.
pub async fn open_hls(
    client: &HttpClient,
    url: &Url,
    params: HlsParams,
    options: StreamOptions,
) -> NagareResult<StreamOutput> {
    let client = client.with_request_args(&options.headers, &options.params)?;
    let policy = options.manifest_retry(params.playlist_reload_attempts);

    let loaded_at = Instant::now();
    match worker::load_playlist(&client, url, &policy).await? {
        (url, Playlist::Media(playlist)) => {
            let worker =
                HlsWorker::new(client.clone(), url, playlist, params.clone(), policy, loaded_at)?;
            Ok(StreamOutput::Single(spawn(&client, worker, &params, &options)?))
        }
        (_, Playlist::Master(master)) => {
            let variant = variants::best_variant(&master)?;
            tracing::info!(
                uri = %variant.uri,
                bandwidth = variant.bandwidth,
                "Master playlist given, opening best variant"
            );
            HlsStream::from_variant(client.clone(), variant.clone(), params, options)
                .open()
                .await
        }
    }
}

/// Lists the streams of the playlist at `url` by name, including the `best`
/// and `worst` synonyms. A media playlist yields a single stream named `live`.
pub async fn parse_hls_variants(
    client: &HttpClient,
    url: &Url,
    params: HlsParams,
    options: StreamOptions,
    variant_options: &VariantOptions,
) -> NagareResult<BTreeMap<String, HlsStream>> {
    let client = client.with_request_args(&options.headers, &options.params)?;
    let policy = options.manifest_retry(params.playlist_reload_attempts);

    let mut streams = BTreeMap::new();
    match worker::load_playlist(&client, url, &policy).await? {
        (url, Playlist::Media(_)) => {
            streams.insert("live".to_string(), HlsStream::new(client, url, params, options));
        }
        (_, Playlist::Master(master)) => {
            for (name, variant) in variants::name_variants(&master) {
                let stream = HlsStream::from_variant(
                    client.clone(),
                    variant.clone(),
                    params.clone(),
                    options.clone(),
                );
                streams.insert(name, stream);
            }
        }
    }
    if streams.is_empty() {
        return Err(NagareError::NoVariants);
    }

    add_synonyms(&mut streams, variant_options)?;
    Ok(streams)
}
