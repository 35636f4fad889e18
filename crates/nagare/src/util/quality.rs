//! Stream naming and `best` / `worst` synonyms.

use std::{
    cmp::Ordering,
    collections::BTreeMap,
    str::FromStr,
    sync::LazyLock,
};

use regex::Regex;

use crate::{error::NagareError, options::VariantOptions};

const ALT_WEIGHT_MOD: f64 = 0.01;

static STREAM_NAME_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d+)(k|p)?(\d+)?(\+)?(?:[a_](\d+)k)?(?:_(alt)(\d)?)?$").unwrap()
});

static SORTING_FILTER_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(<=|>=|<|>)?([\w+]+)$").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeightGroup {
    None,
    Bitrate,
    Pixels,
}

/// Weight of a stream name such as `720p`, `1080p60`, `2500k` or `720p_alt2`.
pub fn stream_weight(name: &str) -> (f64, WeightGroup) {
    let Some(captures) = STREAM_NAME_REGEX.captures(name) else {
        return (0., WeightGroup::None);
    };
    let number = |i: usize| {
        captures
            .get(i)
            .and_then(|m| m.as_str().parse::<f64>().ok())
            .unwrap_or(0.)
    };

    let mut weight = 0.;
    if captures.get(6).is_some() {
        weight -= match captures.get(7) {
            Some(_) => ALT_WEIGHT_MOD * number(7),
            None => ALT_WEIGHT_MOD,
        };
    }

    match captures.get(2).map(|m| m.as_str()) {
        Some("k") => (weight + number(1), WeightGroup::Bitrate),
        Some("p") => {
            weight += number(1) + number(3);
            if captures.get(4).is_some() {
                weight += 1.;
            }
            weight += number(5) / 1000.;
            (weight, WeightGroup::Pixels)
        }
        _ => (0., WeightGroup::None),
    }
}

/// Name of a variant: `{height}p`, `{height}p{fps}` above 30 fps, or `{bandwidth}k`.
pub fn variant_name(height: Option<u64>, frame_rate: Option<f64>, bandwidth: u64) -> String {
    match height {
        Some(height) if height > 0 => match frame_rate {
            Some(fps) if fps > 30. => format!("{height}p{}", fps.round() as u64),
            _ => format!("{height}p"),
        },
        _ if bandwidth >= 1000 => format!("{}k", bandwidth / 1000),
        _ => format!("{}k", bandwidth as f64 / 1000.),
    }
}

/// Picks a free name for `name`: itself, then `_alt`, then `_alt2`.
/// Returns `None` when all of them are taken.
pub fn unique_name<T>(name: String, streams: &BTreeMap<String, T>) -> Option<String> {
    if !streams.contains_key(&name) {
        return Some(name);
    }
    let alt = format!("{name}_alt");
    let taken = streams.keys().filter(|k| k.starts_with(&alt)).count();
    match taken {
        0 => Some(alt),
        1 => Some(format!("{alt}2")),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy)]
enum FilterOp {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
}

/// A `stream_sorting_excludes` expression, e.g. `>720p` or `<=1500k`.
#[derive(Debug, Clone)]
pub struct SortingFilter {
    op: FilterOp,
    weight: f64,
    group: WeightGroup,
}

impl SortingFilter {
    /// Whether `name` stays eligible for `best` / `worst`.
    pub fn keeps(&self, name: &str) -> bool {
        let (weight, group) = stream_weight(name);
        if group != self.group {
            return true;
        }
        let matches = match self.op {
            FilterOp::Lt => weight < self.weight,
            FilterOp::Le => weight <= self.weight,
            FilterOp::Gt => weight > self.weight,
            FilterOp::Ge => weight >= self.weight,
            FilterOp::Eq => weight == self.weight,
        };
        !matches
    }
}

impl FromStr for SortingFilter {
    type Err = NagareError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let captures = SORTING_FILTER_REGEX
            .captures(s.trim())
            .ok_or_else(|| NagareError::StreamNotFound(format!("invalid sorting filter: {s}")))?;
        let op = match captures.get(1).map(|m| m.as_str()) {
            Some("<") => FilterOp::Lt,
            Some("<=") => FilterOp::Le,
            Some(">") => FilterOp::Gt,
            Some(">=") => FilterOp::Ge,
            _ => FilterOp::Eq,
        };
        let (weight, group) = stream_weight(&captures[2]);
        Ok(Self { op, weight, group })
    }
}

fn by_weight(a: &str, b: &str) -> Ordering {
    stream_weight(a).0.total_cmp(&stream_weight(b).0)
}

/// Adds `best` / `worst` (or `best-unfiltered` / `worst-unfiltered` when the
/// excludes remove every stream) to a map of named streams.
pub fn add_synonyms<T: Clone>(
    streams: &mut BTreeMap<String, T>,
    options: &VariantOptions,
) -> Result<(), NagareError> {
    let single = streams.len() == 1;
    let mut sorted: Vec<String> = streams
        .keys()
        .filter(|name| single || stream_weight(name).0 > 0.)
        .cloned()
        .collect();
    sorted.sort_by(|a, b| by_weight(a, b));
    let unfiltered = sorted.clone();

    for expr in &options.stream_sorting_excludes {
        let filter: SortingFilter = expr.parse()?;
        sorted.retain(|name| filter.keeps(name));
    }

    let (suffix, candidates) = if !sorted.is_empty() {
        ("", sorted)
    } else {
        ("-unfiltered", unfiltered)
    };
    if let (Some(worst), Some(best)) = (candidates.first(), candidates.last()) {
        let worst = streams[worst].clone();
        let best = streams[best].clone();
        streams.insert(format!("worst{suffix}"), worst);
        streams.insert(format!("best{suffix}"), best);
    }
    Ok(())
}
