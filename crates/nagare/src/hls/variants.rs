use std::{cmp::Ordering, collections::BTreeMap};

use crate::{
    error::{NagareError, NagareResult},
    hls::m3u8::{MasterPlaylist, Media, MediaType, VariantStream},
    util::quality::{unique_name, variant_name},
};

fn compare_quality(a: &VariantStream, b: &VariantStream) -> Ordering {
    // compare resolution first
    let resolution = |v: &VariantStream| v.resolution.map(|r| (r.width, r.height));
    if let (Some(a), Some(b)) = (resolution(a), resolution(b)) {
        if a != b {
            return a.cmp(&b);
        }
    }

    // compare framerate then
    if let (Some(a), Some(b)) = (a.frame_rate, b.frame_rate) {
        let (a, b) = (a as u64, b as u64);
        if a != b {
            return a.cmp(&b);
        }
    }

    // compare bandwidth finally
    a.bandwidth.cmp(&b.bandwidth)
}

/// The variant an unqualified master playlist URL resolves to.
pub fn best_variant(master: &MasterPlaylist) -> NagareResult<&VariantStream> {
    master
        .variants
        .iter()
        .max_by(|a, b| compare_quality(a, b))
        .ok_or(NagareError::NoVariants)
}

/// Names every variant, highest bandwidth first. Variants whose name is taken
/// three times over are dropped.
pub fn name_variants(master: &MasterPlaylist) -> BTreeMap<String, &VariantStream> {
    let mut variants: Vec<&VariantStream> = master.variants.iter().collect();
    variants.sort_by(|a, b| b.bandwidth.cmp(&a.bandwidth));

    let mut named = BTreeMap::new();
    for variant in variants {
        let name = variant_name(
            variant.resolution.map(|r| r.height),
            variant.frame_rate,
            variant.bandwidth,
        );
        match unique_name(name, &named) {
            Some(name) => {
                named.insert(name, variant);
            }
            None => tracing::debug!(uri = %variant.uri, "Dropping duplicate variant"),
        }
    }
    named
}

/// External audio renditions to open next to `variant`.
///
/// Renditions matching `audio_select` by language or name win, `*` selects
/// all of them. Without a match the default rendition is used, then the first
/// one. Renditions without a URI are muxed into the variant and never selected.
pub fn select_audio(variant: &VariantStream, audio_select: &[String]) -> Vec<Media> {
    let audio: Vec<&Media> = variant
        .media
        .iter()
        .filter(|m| m.media_type == MediaType::Audio && m.uri.is_some())
        .collect();
    if audio.is_empty() {
        return Vec::new();
    }

    let select_all = audio_select.iter().any(|s| s == "*");
    let selected: Vec<Media> = audio
        .iter()
        .filter(|m| {
            select_all
                || audio_select.iter().any(|s| {
                    m.language.as_deref() == Some(s.as_str()) || m.name == *s
                })
        })
        .map(|m| (*m).clone())
        .collect();
    if !selected.is_empty() {
        return selected;
    }

    let fallback = audio.iter().find(|m| m.default).unwrap_or(&audio[0]);
    vec![(*fallback).clone()]
}
