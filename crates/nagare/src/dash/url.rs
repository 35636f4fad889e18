use reqwest::Url;

use crate::{
    error::{NagareError, NagareResult},
    util::range::ByteRange,
};

pub(crate) fn is_absolute_url(s: &str) -> bool {
    s.starts_with("http://") || s.starts_with("https://") || s.starts_with("file://")
}

/// Resolves `new` against `current`, keeping the query of `current` when the
/// relative reference has none.
///
/// merge_baseurls(https://example.com/manifest.mpd?auth=secret, /video42.mp4) =>
///   https://example.com/video42.mp4?auth=secret
pub(crate) fn merge_baseurls(current: &Url, new: &str) -> NagareResult<Url> {
    let new = new.trim();
    if is_absolute_url(new) {
        return Ok(Url::parse(new)?);
    }

    let mut merged = current.join(new)?;
    if merged.query().is_none() {
        merged.set_query(current.query());
    }
    Ok(merged)
}

/// Parses a `first-last` byte range as used by `@mediaRange` and `@range`.
pub(crate) fn parse_media_range(s: &str) -> NagareResult<ByteRange> {
    let invalid = || NagareError::MpdParseError(format!("invalid media range: {s:?}"));

    let (start, end) = s.trim().split_once('-').ok_or_else(invalid)?;
    let first: u64 = start.parse().map_err(|_| invalid())?;
    let last = match end {
        "" => None,
        end => Some(end.parse::<u64>().map_err(|_| invalid())?),
    };
    if last.is_some_and(|last| last < first) {
        return Err(invalid());
    }

    // 0-500 covers 501 bytes
    Ok(ByteRange::new(first, last.map(|last| last - first + 1)))
}
