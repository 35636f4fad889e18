//! Segment generation for a single representation.
//!
//! Static presentations list every segment of the period. Dynamic
//! presentations map the period onto the wall clock: each segment carries the
//! time at which it becomes available (the end of its media time), and only
//! segments inside the `timeShiftBufferDepth` window are produced. Without a
//! declared depth the window spans [`DEFAULT_BUFFER_DEPTH`] behind the live edge.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use reqwest::Url;

use crate::{
    dash::{
        mpd::{Addressing, Initialization, Mpd, Period, Representation, SegmentTemplate},
        template::Template,
        url::merge_baseurls,
    },
    error::{NagareError, NagareResult},
    util::range::ByteRange,
};

#[derive(Debug, Clone, PartialEq)]
pub struct DashSegment {
    pub uri: Url,
    pub byte_range: Option<ByteRange>,
    /// `$Number$` of the segment, or its index for lists.
    pub number: u64,
    /// `$Time$` of the segment, in timescale units.
    pub time: Option<u64>,
    /// Duration in seconds.
    pub duration: f64,
    /// Initialization section rather than media.
    pub init: bool,
    pub available_at: Option<DateTime<Utc>>,
}

impl DashSegment {
    /// Position of the segment in the representation, comparable across
    /// manifest reloads.
    pub fn position(&self) -> u64 {
        self.time.unwrap_or(self.number)
    }

    fn init(init: &Initialization) -> Self {
        Self {
            uri: init.uri.clone(),
            byte_range: init.range,
            number: 0,
            time: None,
            duration: 0.,
            init: true,
            available_at: None,
        }
    }
}

/// Window of a dynamic presentation without `timeShiftBufferDepth`.
pub const DEFAULT_BUFFER_DEPTH: Duration = Duration::from_secs(300);

fn seconds(seconds: f64) -> TimeDelta {
    TimeDelta::milliseconds((seconds * 1000.).round() as i64)
}

fn as_seconds(delta: TimeDelta) -> f64 {
    delta.num_milliseconds() as f64 / 1000.
}

struct Window {
    /// Wall clock time of the period start.
    origin: DateTime<Utc>,
    now: DateTime<Utc>,
    /// Segments ending before this are no longer available.
    earliest: DateTime<Utc>,
    /// `suggestedPresentationDelay` in seconds.
    delay: f64,
}

impl Window {
    fn new(mpd: &Mpd, period: &Period, now: DateTime<Utc>) -> NagareResult<Option<Self>> {
        if !mpd.is_dynamic() {
            return Ok(None);
        }
        let start = mpd.availability_start_time.ok_or_else(|| {
            NagareError::MpdParseError("dynamic MPD without availabilityStartTime".to_string())
        })?;
        let depth = mpd.time_shift_buffer_depth.unwrap_or(DEFAULT_BUFFER_DEPTH);
        Ok(Some(Self {
            origin: start + seconds(period.start.as_secs_f64()),
            now,
            earliest: now - seconds(depth.as_secs_f64()),
            delay: mpd
                .suggested_presentation_delay
                .map_or(0., |delay| delay.as_secs_f64()),
        }))
    }

    /// Seconds of period time elapsed.
    fn elapsed(&self) -> f64 {
        as_seconds(self.now - self.origin)
    }

    fn available_at(&self, end: f64) -> DateTime<Utc> {
        self.origin + seconds(end)
    }

    fn contains(&self, available_at: DateTime<Utc>) -> bool {
        available_at >= self.earliest
    }
}

/// Segments of `representation` in `period`, initialization section first.
pub fn segments(
    mpd: &Mpd,
    period: &Period,
    representation: &Representation,
    now: DateTime<Utc>,
) -> NagareResult<Vec<DashSegment>> {
    let window = Window::new(mpd, period, now)?;
    let period_duration = period.duration.map(|d| d.as_secs_f64());

    match &representation.addressing {
        Addressing::Base(base) => {
            let mut segments = Vec::with_capacity(2);
            // a range of the media resource itself is already part of it
            if let Some(init) = base
                .initialization
                .as_ref()
                .filter(|init| init.uri != representation.base_url)
            {
                segments.push(DashSegment::init(init));
            }
            segments.push(DashSegment {
                uri: representation.base_url.clone(),
                byte_range: None,
                number: 0,
                time: None,
                duration: period_duration.unwrap_or_default(),
                init: false,
                available_at: window.as_ref().map(|w| w.origin),
            });
            Ok(segments)
        }
        Addressing::List(list) => {
            let duration = list.duration.unwrap_or(0) as f64 / list.timescale() as f64;
            let mut segments: Vec<DashSegment> =
                list.initialization.iter().map(DashSegment::init).collect();
            for (index, url) in list.urls.iter().enumerate() {
                let available_at = window
                    .as_ref()
                    .map(|w| w.available_at((index + 1) as f64 * duration));
                if let (Some(window), Some(at)) = (&window, available_at) {
                    if !window.contains(at) {
                        continue;
                    }
                }
                segments.push(DashSegment {
                    uri: url.uri.clone(),
                    byte_range: url.range,
                    number: list.start_number() + index as u64,
                    time: None,
                    duration,
                    init: false,
                    available_at,
                });
            }
            Ok(segments)
        }
        Addressing::Template(template) => {
            let generator = TemplateSegments {
                template,
                representation,
                window: window.as_ref(),
                period_duration,
            };
            let mut segments = Vec::new();
            if let Some(init) = generator.initialization()? {
                segments.push(init);
            }
            match &template.timeline {
                Some(_) => generator.timeline(&mut segments)?,
                None => generator.numbered(&mut segments)?,
            }
            Ok(segments)
        }
    }
}

struct TemplateSegments<'a> {
    template: &'a SegmentTemplate,
    representation: &'a Representation,
    window: Option<&'a Window>,
    period_duration: Option<f64>,
}

impl TemplateSegments<'_> {
    fn variables(&self) -> Template {
        let mut variables = Template::new();
        variables
            .insert(Template::REPRESENTATION_ID, self.representation.id.clone())
            .insert(Template::BANDWIDTH, self.representation.bandwidth.to_string());
        variables
    }

    fn initialization(&self) -> NagareResult<Option<DashSegment>> {
        let Some(initialization) = &self.template.initialization else {
            return Ok(None);
        };
        let uri = merge_baseurls(
            &self.representation.base_url,
            &self.variables().resolve(initialization),
        )?;
        Ok(Some(DashSegment::init(&Initialization { uri, range: None })))
    }

    fn media(&self) -> NagareResult<&str> {
        self.template.media.as_deref().ok_or_else(|| {
            NagareError::MpdParseError(format!(
                "missing media template in representation {}",
                self.representation.id
            ))
        })
    }

    fn segment(
        &self,
        variables: &mut Template,
        number: u64,
        time: u64,
        duration: f64,
        available_at: Option<DateTime<Utc>>,
    ) -> NagareResult<DashSegment> {
        variables
            .insert(Template::NUMBER, number.to_string())
            .insert(Template::TIME, time.to_string());
        let uri = merge_baseurls(&self.representation.base_url, &variables.resolve(self.media()?))?;
        Ok(DashSegment {
            uri,
            byte_range: None,
            number,
            time: Some(time),
            duration,
            init: false,
            available_at,
        })
    }

    /// `SegmentTemplate@duration` addressing.
    fn numbered(&self, segments: &mut Vec<DashSegment>) -> NagareResult<()> {
        let timescale = self.template.timescale();
        let duration = self
            .template
            .duration
            .filter(|d| *d > 0)
            .ok_or_else(|| {
                NagareError::MpdParseError(format!(
                    "SegmentTemplate of representation {} has neither duration nor timeline",
                    self.representation.id
                ))
            })?;
        let segment_duration = duration as f64 / timescale as f64;
        let start_number = self.template.start_number();
        let offset = self.template.presentation_time_offset();
        // number of segments in a bounded period
        let count = self
            .period_duration
            .map(|period| (period / segment_duration).ceil() as u64);

        // wall clock seconds between the period start and segment 0
        let shift = offset as f64 / timescale as f64;

        let (first, last) = match self.window {
            None => {
                let count = count.ok_or_else(|| {
                    NagareError::MpdParseError("unknown duration of static period".to_string())
                })?;
                if count == 0 {
                    return Ok(());
                }
                (0, count - 1)
            }
            Some(window) => {
                let elapsed = window.elapsed() - shift - window.delay;
                if elapsed < 0. {
                    return Ok(());
                }
                // the newest segment to present, usually still being produced
                let mut current = (elapsed / segment_duration).floor() as u64;
                if let Some(count) = count {
                    if count == 0 {
                        return Ok(());
                    }
                    current = current.min(count - 1);
                }
                let depth = as_seconds(window.now - window.earliest);
                (current.saturating_sub((depth / segment_duration) as u64), current)
            }
        };

        let mut variables = self.variables();
        for index in first..=last {
            let available_at = self
                .window
                .map(|w| w.available_at(shift + (index + 1) as f64 * segment_duration));
            segments.push(self.segment(
                &mut variables,
                start_number + index,
                offset + index * duration,
                segment_duration,
                available_at,
            )?);
        }
        Ok(())
    }

    /// `SegmentTimeline` addressing.
    fn timeline(&self, segments: &mut Vec<DashSegment>) -> NagareResult<()> {
        let entries = self.template.timeline.as_deref().unwrap_or_default();
        let timescale = self.template.timescale() as f64;
        let offset = self.template.presentation_time_offset();
        let period_end = self
            .period_duration
            .map(|duration| offset + (duration * timescale) as u64);

        let mut variables = self.variables();
        let mut number = self.template.start_number();
        let mut time = entries.first().and_then(|s| s.t).unwrap_or(offset);

        for (index, entry) in entries.iter().enumerate() {
            if entry.d == 0 {
                return Err(NagareError::MpdParseError(
                    "SegmentTimeline entry without duration".to_string(),
                ));
            }
            if let Some(t) = entry.t {
                time = t;
            }

            let mut count = if entry.r >= 0 {
                entry.r as u64 + 1
            } else {
                let next = entries.get(index + 1).and_then(|s| s.t);
                match (next, period_end, self.window) {
                    (Some(end), _, _) | (None, Some(end), _) => {
                        end.saturating_sub(time).div_ceil(entry.d)
                    }
                    // open ended: everything produced so far
                    (None, None, Some(window)) => {
                        let now = offset + (window.elapsed().max(0.) * timescale) as u64;
                        now.saturating_sub(time) / entry.d
                    }
                    (None, None, None) => 1,
                }
            };

            if let Some(window) = self.window {
                // entries that left the window are not built at all
                let earliest = offset
                    + (as_seconds(window.earliest - window.origin).max(0.) * timescale) as u64;
                let skip = (earliest.saturating_sub(time + 1) / entry.d).min(count);
                time += skip * entry.d;
                number += skip;
                count -= skip;
            }

            for _ in 0..count {
                if period_end.is_some_and(|end| time >= end) {
                    return Ok(());
                }
                let duration = entry.d as f64 / timescale;
                let end = (time + entry.d).saturating_sub(offset) as f64 / timescale;
                let available_at = self.window.map(|w| w.available_at(end));
                let visible = match (self.window, available_at) {
                    (Some(window), Some(at)) => window.contains(at),
                    _ => true,
                };
                if visible {
                    segments.push(self.segment(&mut variables, number, time, duration, available_at)?);
                }
                time += entry.d;
                number += 1;
            }
        }
        Ok(())
    }
}
