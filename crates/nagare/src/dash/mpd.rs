use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::Url;

use crate::{
    dash::{
        duration::{parse_datetime, parse_duration},
        url::{merge_baseurls, parse_media_range},
        xml::Element,
    },
    error::{NagareError, NagareResult},
    util::range::ByteRange,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentationType {
    Static,
    Dynamic,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UtcTiming {
    pub scheme_id_uri: String,
    pub value: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Mpd {
    pub presentation_type: PresentationType,
    pub availability_start_time: Option<DateTime<Utc>>,
    pub publish_time: Option<DateTime<Utc>>,
    pub media_presentation_duration: Option<Duration>,
    pub minimum_update_period: Option<Duration>,
    pub time_shift_buffer_depth: Option<Duration>,
    pub suggested_presentation_delay: Option<Duration>,
    pub utc_timing: Vec<UtcTiming>,
    pub periods: Vec<Period>,
}

#[derive(Debug, Clone)]
pub struct Period {
    pub id: Option<String>,
    /// Offset from the presentation start.
    pub start: Duration,
    pub duration: Option<Duration>,
    pub adaptation_sets: Vec<AdaptationSet>,
}

#[derive(Debug, Clone)]
pub struct AdaptationSet {
    pub id: Option<String>,
    pub content_type: Option<String>,
    pub lang: Option<String>,
    pub representations: Vec<Representation>,
}

#[derive(Debug, Clone)]
pub struct Representation {
    pub id: String,
    pub bandwidth: u64,
    pub mime_type: Option<String>,
    /// `contentType` of the representation or its adaptation set, falling back
    /// to the top-level type of the mime type.
    pub content_type: Option<String>,
    pub codecs: Option<String>,
    pub width: Option<u64>,
    pub height: Option<u64>,
    pub frame_rate: Option<f64>,
    pub lang: Option<String>,
    pub base_url: Url,
    pub addressing: Addressing,
}

impl Representation {
    pub fn is_video(&self) -> bool {
        self.content_type.as_deref() == Some("video")
    }

    pub fn is_audio(&self) -> bool {
        self.content_type.as_deref() == Some("audio")
    }
}

#[derive(Debug, Clone)]
pub enum Addressing {
    Base(SegmentBase),
    List(SegmentList),
    Template(SegmentTemplate),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Initialization {
    pub uri: Url,
    pub range: Option<ByteRange>,
}

#[derive(Debug, Clone, Default)]
pub struct SegmentBase {
    pub initialization: Option<Initialization>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SegmentUrl {
    pub uri: Url,
    pub range: Option<ByteRange>,
}

#[derive(Debug, Clone, Default)]
pub struct SegmentList {
    pub initialization: Option<Initialization>,
    pub timescale: Option<u64>,
    pub duration: Option<u64>,
    pub start_number: Option<u64>,
    pub urls: Vec<SegmentUrl>,
}

impl SegmentList {
    pub fn timescale(&self) -> u64 {
        self.timescale.filter(|t| *t > 0).unwrap_or(1)
    }

    pub fn start_number(&self) -> u64 {
        self.start_number.unwrap_or(1)
    }
}

/// `S` element of a `SegmentTimeline`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimelineEntry {
    pub t: Option<u64>,
    pub d: u64,
    /// Additional repetitions, -1 repeats until the next `t` or the period end.
    pub r: i64,
}

/// A `SegmentTemplate` after inheriting attributes declared on the period and
/// adaptation set.
#[derive(Debug, Clone, Default)]
pub struct SegmentTemplate {
    pub media: Option<String>,
    pub initialization: Option<String>,
    pub timescale: Option<u64>,
    pub duration: Option<u64>,
    pub start_number: Option<u64>,
    pub presentation_time_offset: Option<u64>,
    pub timeline: Option<Vec<TimelineEntry>>,
}

impl SegmentTemplate {
    pub fn timescale(&self) -> u64 {
        self.timescale.filter(|t| *t > 0).unwrap_or(1)
    }

    pub fn start_number(&self) -> u64 {
        self.start_number.unwrap_or(1)
    }

    pub fn presentation_time_offset(&self) -> u64 {
        self.presentation_time_offset.unwrap_or(0)
    }

    fn inherit(element: &Element, parent: Option<&Self>) -> NagareResult<Self> {
        let parent = parent.cloned().unwrap_or_default();
        let timeline = match element.child("SegmentTimeline") {
            Some(timeline) => Some(
                timeline
                    .children("S")
                    .map(|s| {
                        Ok(TimelineEntry {
                            t: s.parse_attr("t")?,
                            d: s.parse_attr("d")?.ok_or_else(|| {
                                NagareError::MpdParseError("S element without @d".to_string())
                            })?,
                            r: s.parse_attr("r")?.unwrap_or(0),
                        })
                    })
                    .collect::<NagareResult<Vec<_>>>()?,
            ),
            None => parent.timeline,
        };

        Ok(Self {
            media: element.attr("media").map(String::from).or(parent.media),
            initialization: element
                .attr("initialization")
                .map(String::from)
                .or(parent.initialization),
            timescale: element.parse_attr("timescale")?.or(parent.timescale),
            duration: element.parse_attr("duration")?.or(parent.duration),
            start_number: element.parse_attr("startNumber")?.or(parent.start_number),
            presentation_time_offset: element
                .parse_attr("presentationTimeOffset")?
                .or(parent.presentation_time_offset),
            timeline,
        })
    }
}

/// Locates a representation across manifest reloads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepresentationRef {
    pub period: usize,
    pub period_id: Option<String>,
    pub adaptation_set: usize,
    pub id: String,
}

impl Mpd {
    /// Parses a manifest fetched from `url`.
    ///
    /// Representations protected by `ContentProtection` are rejected.
    pub fn parse(text: &str, url: &Url) -> NagareResult<Self> {
        let root = Element::parse(text)?;
        if root.name != "MPD" {
            return Err(NagareError::MpdParseError(format!(
                "unexpected root element <{}>",
                root.name
            )));
        }

        let presentation_type = match root.attr("type") {
            Some("dynamic") => PresentationType::Dynamic,
            _ => PresentationType::Static,
        };
        let duration_attr = |name: &str| root.attr(name).map(parse_duration).transpose();
        let date_attr = |name: &str| root.attr(name).map(parse_datetime).transpose();

        let media_presentation_duration = duration_attr("mediaPresentationDuration")?;
        let base_url = base_url(&root, url)?;
        let utc_timing = root
            .children("UTCTiming")
            .filter_map(|timing| {
                Some(UtcTiming {
                    scheme_id_uri: timing.attr("schemeIdUri")?.to_string(),
                    value: timing.attr("value").map(String::from),
                })
            })
            .collect();

        let mut periods: Vec<Period> = Vec::new();
        for element in root.children("Period") {
            let start = match element.attr("start").map(parse_duration).transpose()? {
                Some(start) => {
                    if let Some(previous) = periods.last_mut() {
                        if previous.duration.is_none() {
                            previous.duration = start.checked_sub(previous.start);
                        }
                    }
                    start
                }
                None => match periods.last() {
                    None => Duration::ZERO,
                    Some(Period {
                        start,
                        duration: Some(duration),
                        ..
                    }) => *start + *duration,
                    Some(_) => {
                        return Err(NagareError::MpdParseError(
                            "period without start following a period without duration"
                                .to_string(),
                        ))
                    }
                },
            };
            periods.push(Period::parse(element, &base_url, start)?);
        }
        if let (Some(last), Some(total)) = (periods.last_mut(), media_presentation_duration) {
            if last.duration.is_none() {
                last.duration = total.checked_sub(last.start);
            }
        }
        if periods.is_empty() {
            return Err(NagareError::MpdParseError("no Period".to_string()));
        }

        let availability_start_time = date_attr("availabilityStartTime")?;
        if presentation_type == PresentationType::Dynamic && availability_start_time.is_none() {
            return Err(NagareError::MpdParseError(
                "dynamic MPD without availabilityStartTime".to_string(),
            ));
        }

        Ok(Self {
            presentation_type,
            availability_start_time,
            publish_time: date_attr("publishTime")?,
            media_presentation_duration,
            minimum_update_period: duration_attr("minimumUpdatePeriod")?,
            time_shift_buffer_depth: duration_attr("timeShiftBufferDepth")?,
            suggested_presentation_delay: duration_attr("suggestedPresentationDelay")?,
            utc_timing,
            periods,
        })
    }

    pub fn is_dynamic(&self) -> bool {
        self.presentation_type == PresentationType::Dynamic
    }

    /// The period streams are selected from: the newest one of a live
    /// presentation, the first one otherwise.
    pub fn selection_period(&self) -> usize {
        if self.is_dynamic() {
            self.periods.len().saturating_sub(1)
        } else {
            0
        }
    }

    /// Every representation of the selection period.
    pub fn representations(&self) -> Vec<(RepresentationRef, &Representation)> {
        let index = self.selection_period();
        let Some(period) = self.periods.get(index) else {
            return Vec::new();
        };
        period
            .adaptation_sets
            .iter()
            .enumerate()
            .flat_map(|(aset_index, aset)| {
                aset.representations.iter().map(move |rep| {
                    let reference = RepresentationRef {
                        period: index,
                        period_id: period.id.clone(),
                        adaptation_set: aset_index,
                        id: rep.id.clone(),
                    };
                    (reference, rep)
                })
            })
            .collect()
    }

    pub fn find(&self, reference: &RepresentationRef) -> NagareResult<(&Period, &Representation)> {
        let not_found = || NagareError::NoRepresentationFound(reference.id.clone());

        let period = match &reference.period_id {
            Some(id) => self.periods.iter().find(|p| p.id.as_ref() == Some(id)),
            None => self.periods.get(reference.period),
        }
        .ok_or_else(not_found)?;
        let representation = period
            .adaptation_sets
            .get(reference.adaptation_set)
            .and_then(|aset| aset.representations.iter().find(|r| r.id == reference.id))
            .ok_or_else(not_found)?;
        Ok((period, representation))
    }
}

impl Period {
    fn parse(element: &Element, base_url: &Url, start: Duration) -> NagareResult<Self> {
        let base_url = self::base_url(element, base_url)?;
        let inherited = Inherited::default().extend(element, &base_url)?;

        let adaptation_sets = element
            .children("AdaptationSet")
            .map(|aset| AdaptationSet::parse(aset, &base_url, &inherited))
            .collect::<NagareResult<_>>()?;

        Ok(Self {
            id: element.attr("id").map(String::from),
            start,
            duration: element.attr("duration").map(parse_duration).transpose()?,
            adaptation_sets,
        })
    }
}

impl AdaptationSet {
    fn parse(element: &Element, base_url: &Url, inherited: &Inherited) -> NagareResult<Self> {
        if element.child("ContentProtection").is_some() {
            return Err(NagareError::DrmProtected(format!(
                "adaptation set {}",
                element.attr("id").unwrap_or("without id")
            )));
        }

        let base_url = self::base_url(element, base_url)?;
        let inherited = inherited.extend(element, &base_url)?;
        let content_type = element.attr("contentType").map(String::from);
        let lang = element.attr("lang").map(String::from);

        let representations = element
            .children("Representation")
            .map(|rep| Representation::parse(rep, element, &base_url, &inherited))
            .collect::<NagareResult<_>>()?;

        Ok(Self {
            id: element.attr("id").map(String::from),
            content_type,
            lang,
            representations,
        })
    }
}

impl Representation {
    fn parse(
        element: &Element,
        aset: &Element,
        base_url: &Url,
        inherited: &Inherited,
    ) -> NagareResult<Self> {
        let id = element
            .attr("id")
            .ok_or_else(|| NagareError::MpdParseError("Representation without @id".to_string()))?
            .to_string();
        if element.child("ContentProtection").is_some() {
            return Err(NagareError::DrmProtected(format!("representation {id}")));
        }

        let base_url = self::base_url(element, base_url)?;
        let inherited = inherited.extend(element, &base_url)?;
        let attr = |name: &str| element.attr(name).or_else(|| aset.attr(name));

        let mime_type = attr("mimeType").map(String::from);
        let content_type = attr("contentType").map(String::from).or_else(|| {
            mime_type
                .as_deref()
                .and_then(|mime| mime.split_once('/'))
                .map(|(top, _)| top.to_string())
        });
        let frame_rate = attr("frameRate").and_then(parse_frame_rate);
        let number = |name: &str| -> NagareResult<Option<u64>> {
            match element.parse_attr(name)? {
                Some(value) => Ok(Some(value)),
                None => aset.parse_attr(name),
            }
        };

        let addressing = match (inherited.template, inherited.list) {
            (Some(template), _) => Addressing::Template(template),
            (None, Some(list)) => Addressing::List(list),
            (None, None) => Addressing::Base(inherited.base.unwrap_or_default()),
        };

        Ok(Self {
            bandwidth: element.parse_attr("bandwidth")?.unwrap_or(0),
            mime_type,
            content_type,
            codecs: attr("codecs").map(String::from),
            width: number("width")?,
            height: number("height")?,
            frame_rate,
            lang: attr("lang").map(String::from),
            base_url,
            addressing,
            id,
        })
    }
}

/// `30`, `25.0` or `30000/1001`
fn parse_frame_rate(value: &str) -> Option<f64> {
    match value.split_once('/') {
        Some((num, den)) => {
            let den: f64 = den.trim().parse().ok()?;
            (den != 0.).then_some(num.trim().parse::<f64>().ok()? / den)
        }
        None => value.trim().parse().ok(),
    }
}

/// The effective base URL of `element`: its first `BaseURL` child resolved
/// against the parent's, or the parent's.
fn base_url(element: &Element, parent: &Url) -> NagareResult<Url> {
    match element.child("BaseURL").map(Element::text) {
        Some(base) if !base.is_empty() => merge_baseurls(parent, base),
        _ => Ok(parent.clone()),
    }
}

fn initialization(element: &Element, base_url: &Url) -> NagareResult<Option<Initialization>> {
    let Some(init) = element.child("Initialization") else {
        return Ok(None);
    };
    let uri = match init.attr("sourceURL") {
        Some(source) => merge_baseurls(base_url, source)?,
        None => base_url.clone(),
    };
    let range = init.attr("range").map(parse_media_range).transpose()?;
    Ok(Some(Initialization { uri, range }))
}

/// Segment addressing declared so far along the Period / AdaptationSet /
/// Representation chain.
#[derive(Debug, Clone, Default)]
struct Inherited {
    base: Option<SegmentBase>,
    list: Option<SegmentList>,
    template: Option<SegmentTemplate>,
}

impl Inherited {
    fn extend(&self, element: &Element, base_url: &Url) -> NagareResult<Self> {
        let mut next = self.clone();

        if let Some(base) = element.child("SegmentBase") {
            next.base = Some(SegmentBase {
                initialization: match initialization(base, base_url)? {
                    Some(init) => Some(init),
                    None => self.base.as_ref().and_then(|b| b.initialization.clone()),
                },
            });
        }

        if let Some(list) = element.child("SegmentList") {
            let parent = self.list.clone().unwrap_or_default();
            let urls: Vec<SegmentUrl> = list
                .children("SegmentURL")
                .map(|url| {
                    let uri = match url.attr("media") {
                        Some(media) => merge_baseurls(base_url, media)?,
                        None => base_url.clone(),
                    };
                    let range = url.attr("mediaRange").map(parse_media_range).transpose()?;
                    Ok(SegmentUrl { uri, range })
                })
                .collect::<NagareResult<_>>()?;
            next.list = Some(SegmentList {
                initialization: match initialization(list, base_url)? {
                    Some(init) => Some(init),
                    None => parent.initialization,
                },
                timescale: list.parse_attr("timescale")?.or(parent.timescale),
                duration: list.parse_attr("duration")?.or(parent.duration),
                start_number: list.parse_attr("startNumber")?.or(parent.start_number),
                urls: if urls.is_empty() { parent.urls } else { urls },
            });
        }

        if let Some(template) = element.child("SegmentTemplate") {
            next.template = Some(SegmentTemplate::inherit(template, self.template.as_ref())?);
        }

        Ok(next)
    }
}
