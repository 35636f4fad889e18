pub mod clock;
pub mod duration;
pub mod mpd;
pub mod template;
pub mod timeline;
pub(crate) mod url;
pub mod worker;
pub mod writer;
pub mod xml;

use std::{collections::BTreeMap, sync::Arc};

use reqwest::Url;

pub use mpd::{Mpd, Representation, RepresentationRef};
pub use timeline::DashSegment;
pub use worker::DashWorker;
pub use writer::DashSegmentWriter;

use crate::{
    dash::clock::Clock,
    error::{NagareError, NagareResult},
    options::{DashParams, StreamOptions, VariantOptions},
    stream::{segmented::spawn_pipeline, Reader, Stream, StreamOutput},
    util::{
        http::HttpClient,
        quality::{add_synonyms, unique_name, variant_name},
    },
};

/// A video and/or audio representation of a DASH presentation.
#[derive(Clone)]
pub struct DashStream {
    client: HttpClient,
    url: Url,
    mpd: Arc<Mpd>,
    video: Option<RepresentationRef>,
    audio: Option<RepresentationRef>,
    params: DashParams,
    options: StreamOptions,
}

impl DashStream {
    pub fn video(&self) -> Option<&Representation> {
        let reference = self.video.as_ref()?;
        self.mpd.find(reference).ok().map(|(_, rep)| rep)
    }

    pub fn audio(&self) -> Option<&Representation> {
        let reference = self.audio.as_ref()?;
        self.mpd.find(reference).ok().map(|(_, rep)| rep)
    }

    fn bandwidth(&self) -> u64 {
        self.video().map_or(0, |r| r.bandwidth) + self.audio().map_or(0, |r| r.bandwidth)
    }
}

impl Stream for DashStream {
    fn url(&self) -> &Url {
        &self.url
    }

    async fn open(&self) -> NagareResult<StreamOutput> {
        let (url, mpd) = if self.mpd.is_dynamic() {
            let policy = self.options.manifest_retry(self.params.manifest_reload_attempts);
            worker::load_manifest(&self.client, &self.url, &policy).await?
        } else {
            (self.url.clone(), (*self.mpd).clone())
        };
        open_representations(
            &self.client,
            &url,
            mpd,
            self.video.clone(),
            self.audio.clone(),
            &self.params,
            &self.options,
        )
        .await
    }
}

async fn open_representations(
    client: &HttpClient,
    url: &Url,
    mpd: Mpd,
    video: Option<RepresentationRef>,
    audio: Option<RepresentationRef>,
    params: &DashParams,
    options: &StreamOptions,
) -> NagareResult<StreamOutput> {
    let policy = options.manifest_retry(params.manifest_reload_attempts);
    let mut clock = Clock::new();
    if mpd.is_dynamic() {
        clock.sync(&mpd.utc_timing, client, &policy).await;
    }

    let spawn = |reference: RepresentationRef| -> NagareResult<Reader> {
        tracing::info!(representation = %reference.id, "Opening representation");
        let worker = DashWorker::new(
            client.clone(),
            url.clone(),
            mpd.clone(),
            reference,
            params.clone(),
            policy,
            clock.clone(),
        )?;
        let writer = DashSegmentWriter::new(client.clone(), options.segment_retry());
        Ok(spawn_pipeline(worker, writer, options))
    };

    match (video, audio) {
        (Some(video), Some(audio)) => Ok(StreamOutput::Muxed {
            video: spawn(video)?,
            audio: vec![spawn(audio)?],
        }),
        (Some(reference), None) | (None, Some(reference)) => {
            Ok(StreamOutput::Single(spawn(reference)?))
        }
        (None, None) => Err(NagareError::NoRepresentationFound(
            "no video or audio representation".to_string(),
        )),
    }
}

fn videos(mpd: &Mpd) -> Vec<(RepresentationRef, &Representation)> {
    mpd.representations()
        .into_iter()
        .filter(|(_, rep)| rep.is_video() || rep.content_type.is_none())
        .collect()
}

/// Audio representations matching `audio_select` by language, `*` selecting
/// all. Without a selection (or a match) only the first listed language is
/// kept.
fn audios<'a>(
    mpd: &'a Mpd,
    audio_select: &[String],
) -> Vec<(RepresentationRef, &'a Representation)> {
    let audio: Vec<_> = mpd
        .representations()
        .into_iter()
        .filter(|(_, rep)| rep.is_audio())
        .collect();
    if audio_select.iter().any(|s| s == "*") {
        return audio;
    }

    let selected: Vec<_> = audio
        .iter()
        .filter(|(_, rep)| {
            rep.lang
                .as_ref()
                .is_some_and(|lang| audio_select.contains(lang))
        })
        .cloned()
        .collect();
    if !selected.is_empty() {
        return selected;
    }

    let first_lang = audio.first().and_then(|(_, rep)| rep.lang.clone());
    audio
        .into_iter()
        .filter(|(_, rep)| rep.lang == first_lang)
        .collect()
}

fn by_id(mpd: &Mpd, id: &str) -> NagareResult<RepresentationRef> {
    mpd.representations()
        .into_iter()
        .find(|(_, rep)| rep.id == id)
        .map(|(reference, _)| reference)
        .ok_or_else(|| NagareError::NoRepresentationFound(id.to_string()))
}

/// Opens the DASH presentation at `url`.
///
/// Representations are chosen by id when given, otherwise the video
/// representation with the highest resolution and bandwidth and the audio
/// representation with the highest bandwidth among the selected languages.
/// Both together open as [`StreamOutput::Muxed`].
pub async fn open_dash(
    client: &HttpClient,
    url: &Url,
    params: DashParams,
    options: StreamOptions,
    video_id: Option<&str>,
    audio_id: Option<&str>,
) -> NagareResult<StreamOutput> {
    let client = client.with_request_args(&options.headers, &options.params)?;
    let policy = options.manifest_retry(params.manifest_reload_attempts);
    let (url, mpd) = worker::load_manifest(&client, url, &policy).await?;

    let video = match video_id {
        Some(id) => Some(by_id(&mpd, id)?),
        None => videos(&mpd)
            .into_iter()
            .max_by_key(|(_, rep)| (rep.height.unwrap_or(0), rep.bandwidth))
            .map(|(reference, _)| reference),
    };
    let audio = match audio_id {
        Some(id) => Some(by_id(&mpd, id)?),
        None => audios(&mpd, &params.audio_select)
            .into_iter()
            .max_by_key(|(_, rep)| rep.bandwidth)
            .map(|(reference, _)| reference),
    };

    open_representations(&client, &url, mpd, video, audio, &params, &options).await
}

/// Lists the streams of the presentation at `url` by name, one per
/// combination of video and selected audio representation, including the
/// `best` and `worst` synonyms.
pub async fn parse_dash_variants(
    client: &HttpClient,
    url: &Url,
    params: DashParams,
    options: StreamOptions,
    variant_options: &VariantOptions,
) -> NagareResult<BTreeMap<String, DashStream>> {
    let client = client.with_request_args(&options.headers, &options.params)?;
    let policy = options.manifest_retry(params.manifest_reload_attempts);
    let (url, mpd) = worker::load_manifest(&client, url, &policy).await?;

    let mpd = Arc::new(mpd);
    let stream = |video: Option<&RepresentationRef>, audio: Option<&RepresentationRef>| DashStream {
        client: client.clone(),
        url: url.clone(),
        mpd: mpd.clone(),
        video: video.cloned(),
        audio: audio.cloned(),
        params: params.clone(),
        options: options.clone(),
    };

    let videos = videos(&mpd);
    let audios = audios(&mpd, &params.audio_select);
    let audio_name = |rep: &Representation| format!("a{}k", rep.bandwidth / 1000);

    let mut candidates: Vec<(String, DashStream)> = Vec::new();
    if videos.is_empty() {
        for (reference, rep) in &audios {
            let name = if audios.len() > 1 {
                audio_name(rep)
            } else {
                "audio_only".to_string()
            };
            candidates.push((name, stream(None, Some(reference))));
        }
    }
    for (video, rep) in &videos {
        let name = variant_name(rep.height, rep.frame_rate, rep.bandwidth);
        if audios.is_empty() {
            candidates.push((name, stream(Some(video), None)));
            continue;
        }
        for (audio, audio_rep) in &audios {
            let name = if audios.len() > 1 {
                format!("{name}+{}", audio_name(audio_rep))
            } else {
                name.clone()
            };
            candidates.push((name, stream(Some(video), Some(audio))));
        }
    }
    candidates.sort_by_key(|(_, stream)| std::cmp::Reverse(stream.bandwidth()));

    let mut result = BTreeMap::new();
    for (name, stream) in candidates {
        match unique_name(name, &result) {
            Some(name) => {
                result.insert(name, stream);
            }
            None => tracing::debug!(url = %stream.url, "Dropping duplicate representation"),
        }
    }
    if result.is_empty() {
        return Err(NagareError::NoRepresentationFound(url.to_string()));
    }

    add_synonyms(&mut result, variant_options)?;
    Ok(result)
}
