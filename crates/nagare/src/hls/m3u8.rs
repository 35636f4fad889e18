//! M3U8 playlist model and parser.
//!
//! The parser is line oriented. Tags update a parser-local state record; a URI
//! line consumes the one-shot parts of that state (duration, byte range, date,
//! discontinuity, gap) while the key and map stay in effect for the following
//! segments.

use std::collections::HashMap;

use chrono::{DateTime, NaiveDateTime, TimeDelta, Utc};
use reqwest::Url;

use crate::{
    decrypt::parse_iv,
    error::{NagareError, NagareResult},
    util::range::ByteRange,
};

#[derive(Debug, Clone)]
pub enum Playlist {
    Master(MasterPlaylist),
    Media(MediaPlaylist),
}

#[derive(Debug, Clone, Default)]
pub struct MasterPlaylist {
    pub variants: Vec<VariantStream>,
    pub iframe_variants: Vec<VariantStream>,
    pub media: Vec<Media>,
    pub independent_segments: bool,
    pub start: Option<Start>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    pub width: u64,
    pub height: u64,
}

#[derive(Debug, Clone)]
pub struct VariantStream {
    pub uri: Url,
    pub bandwidth: u64,
    pub average_bandwidth: Option<u64>,
    pub codecs: Option<String>,
    pub resolution: Option<Resolution>,
    pub frame_rate: Option<f64>,
    pub audio: Option<String>,
    pub video: Option<String>,
    pub subtitles: Option<String>,
    /// Renditions of the groups this variant references.
    pub media: Vec<Media>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaType {
    Audio,
    Video,
    Subtitles,
    ClosedCaptions,
}

#[derive(Debug, Clone)]
pub struct Media {
    pub media_type: MediaType,
    pub uri: Option<Url>,
    pub group_id: String,
    pub language: Option<String>,
    pub name: String,
    pub default: bool,
    pub autoselect: bool,
    pub channels: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaylistType {
    Event,
    Vod,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Start {
    pub time_offset: f64,
    pub precise: bool,
}

#[derive(Debug, Clone)]
pub struct DateRange {
    pub id: String,
    pub class: Option<String>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub duration: Option<f64>,
    pub planned_duration: Option<f64>,
    pub end_on_next: bool,
    /// `X-` client attributes, unquoted.
    pub client_attributes: HashMap<String, String>,
}

#[derive(Debug, Clone, Default)]
pub struct MediaPlaylist {
    pub version: Option<u32>,
    pub target_duration: f64,
    pub media_sequence: u64,
    pub discontinuity_sequence: u64,
    pub end_list: bool,
    pub playlist_type: Option<PlaylistType>,
    pub iframes_only: bool,
    pub independent_segments: bool,
    pub allow_cache: Option<bool>,
    pub start: Option<Start>,
    pub date_ranges: Vec<DateRange>,
    pub segments: Vec<HlsSegment>,
}

impl MediaPlaylist {
    pub fn is_live(&self) -> bool {
        !self.end_list
    }

    pub fn last_sequence(&self) -> Option<u64> {
        self.segments.last().map(|s| s.sequence)
    }

    pub fn total_duration(&self) -> f64 {
        self.segments.iter().map(|s| s.duration).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyMethod {
    None,
    Aes128,
    SampleAes,
    Other(String),
}

impl From<&str> for KeyMethod {
    fn from(s: &str) -> Self {
        match s {
            "NONE" => KeyMethod::None,
            "AES-128" => KeyMethod::Aes128,
            "SAMPLE-AES" => KeyMethod::SampleAes,
            other => KeyMethod::Other(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Key {
    pub method: KeyMethod,
    pub uri: Option<Url>,
    pub iv: Option<[u8; 16]>,
    pub key_format: Option<String>,
    pub key_format_versions: Option<String>,
}

impl Key {
    pub fn is_identity_format(&self) -> bool {
        self.key_format
            .as_deref()
            .map_or(true, |format| format == "identity")
    }
}

/// Init section of the following segments.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Map {
    pub uri: Url,
    pub byte_range: Option<ByteRange>,
}

#[derive(Debug, Clone)]
pub struct HlsSegment {
    pub uri: Url,
    pub sequence: u64,
    pub duration: f64,
    pub title: Option<String>,
    pub key: Option<Key>,
    pub byte_range: Option<ByteRange>,
    pub map: Option<Map>,
    pub discontinuity: bool,
    pub date: Option<DateTime<Utc>>,
    pub gap: bool,
}

/// Attribute list of a tag, with quoted values unquoted.
#[derive(Debug, Default)]
pub struct Attributes(HashMap<String, String>);

impl Attributes {
    pub fn parse(input: &str) -> Self {
        let mut attributes = HashMap::new();
        let mut rest = input.trim();

        while !rest.is_empty() {
            let Some((name, after)) = rest.split_once('=') else {
                break;
            };
            let name = name.trim().trim_start_matches(',').trim().to_string();
            let after = after.trim_start();

            let (value, remaining) = if let Some(quoted) = after.strip_prefix('"') {
                match quoted.split_once('"') {
                    Some((value, remaining)) => (value.to_string(), remaining),
                    None => (quoted.to_string(), ""),
                }
            } else {
                match after.split_once(',') {
                    Some((value, remaining)) => (value.trim().to_string(), remaining),
                    None => (after.trim().to_string(), ""),
                }
            };
            attributes.insert(name, value);

            rest = remaining.trim_start();
            rest = rest.strip_prefix(',').unwrap_or(rest).trim_start();
        }

        Self(attributes)
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(|s| s.as_str())
    }

    pub fn string(&self, name: &str) -> Option<String> {
        self.get(name).map(str::to_string)
    }

    pub fn u64(&self, name: &str) -> Option<u64> {
        let value = self.get(name)?;
        match value
            .strip_prefix("0x")
            .or_else(|| value.strip_prefix("0X"))
        {
            Some(hex) => u64::from_str_radix(hex, 16).ok(),
            None => value.parse().ok(),
        }
    }

    pub fn f64(&self, name: &str) -> Option<f64> {
        self.get(name)?.parse().ok()
    }

    pub fn bool(&self, name: &str) -> bool {
        self.get(name) == Some("YES")
    }

    pub fn resolution(&self, name: &str) -> Option<Resolution> {
        let (width, height) = self.get(name)?.split_once(['x', 'X'])?;
        Some(Resolution {
            width: width.trim().parse().ok()?,
            height: height.trim().parse().ok()?,
        })
    }

    pub fn date(&self, name: &str) -> Option<DateTime<Utc>> {
        parse_date(self.get(name)?)
    }

    fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.0.iter()
    }
}

pub fn parse_date(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    DateTime::parse_from_rfc3339(value)
        .or_else(|_| DateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f%z"))
        .map(|date| date.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f")
                .ok()
                .map(|date| date.and_utc())
        })
}

/// `length[@offset]`
fn parse_byte_range(value: &str) -> Option<(u64, Option<u64>)> {
    let (length, offset) = match value.trim().split_once('@') {
        Some((length, offset)) => (length, Some(offset.trim().parse().ok()?)),
        None => (value, None),
    };
    Some((length.trim().parse().ok()?, offset))
}

#[derive(Default)]
struct ParserState {
    // one-shot
    extinf: Option<(f64, Option<String>)>,
    byte_range: Option<(u64, Option<u64>)>,
    discontinuity: bool,
    date: Option<DateTime<Utc>>,
    gap: bool,
    stream_inf: Option<Attributes>,

    // sticky
    key: Option<Key>,
    map: Option<Map>,
    // a key tag was seen since the last URI line
    key_declared: bool,
}

struct Parser<'a> {
    base: &'a Url,
    state: ParserState,
    master: MasterPlaylist,
    media: MediaPlaylist,
    is_master: bool,
}

impl Playlist {
    /// Parses a playlist fetched from `url`, against which relative URIs are
    /// resolved.
    pub fn parse(text: &str, url: &Url) -> NagareResult<Self> {
        let mut lines = text
            .lines()
            .map(|line| line.trim())
            .filter(|line| !line.is_empty());

        match lines.next() {
            Some(first) if first.trim_start_matches('\u{feff}') == "#EXTM3U" => {}
            _ => {
                return Err(NagareError::M3u8ParseError(
                    "missing #EXTM3U header".to_string(),
                ))
            }
        }

        let mut parser = Parser {
            base: url,
            state: ParserState::default(),
            master: MasterPlaylist::default(),
            media: MediaPlaylist::default(),
            is_master: false,
        };
        for line in lines {
            match line.strip_prefix('#') {
                Some(tag) => parser.tag(tag)?,
                None => parser.uri(line)?,
            }
        }
        Ok(parser.finish())
    }

    pub fn into_media(self) -> NagareResult<MediaPlaylist> {
        match self {
            Playlist::Media(media) => Ok(media),
            Playlist::Master(_) => Err(NagareError::M3u8ParseError(
                "expected a media playlist, got a master playlist".to_string(),
            )),
        }
    }
}

impl Parser<'_> {
    fn resolve(&self, uri: &str) -> NagareResult<Url> {
        Ok(self.base.join(uri)?)
    }

    fn tag(&mut self, line: &str) -> NagareResult<()> {
        let (name, value) = line.split_once(':').unwrap_or((line, ""));
        let value = value.trim();

        match name {
            "EXTINF" => {
                let (duration, title) = value.split_once(',').unwrap_or((value, ""));
                let duration = duration.trim().parse::<f64>().map_err(|_| {
                    NagareError::M3u8ParseError(format!("invalid EXTINF duration: {value}"))
                })?;
                let title = Some(title.trim())
                    .filter(|t| !t.is_empty())
                    .map(str::to_string);
                self.state.extinf = Some((duration, title));
            }
            "EXT-X-TARGETDURATION" => {
                self.media.target_duration = value.parse().map_err(|_| {
                    NagareError::M3u8ParseError(format!("invalid target duration: {value}"))
                })?;
            }
            "EXT-X-MEDIA-SEQUENCE" => {
                self.media.media_sequence = value.parse().map_err(|_| {
                    NagareError::M3u8ParseError(format!("invalid media sequence: {value}"))
                })?;
            }
            "EXT-X-DISCONTINUITY-SEQUENCE" => {
                self.media.discontinuity_sequence = value.parse().unwrap_or_default();
            }
            "EXT-X-VERSION" => self.media.version = value.parse().ok(),
            "EXT-X-ENDLIST" => self.media.end_list = true,
            "EXT-X-PLAYLIST-TYPE" => {
                self.media.playlist_type = match value {
                    "VOD" => Some(PlaylistType::Vod),
                    "EVENT" => Some(PlaylistType::Event),
                    _ => None,
                };
            }
            "EXT-X-I-FRAMES-ONLY" => self.media.iframes_only = true,
            "EXT-X-INDEPENDENT-SEGMENTS" => {
                self.media.independent_segments = true;
                self.master.independent_segments = true;
            }
            "EXT-X-ALLOW-CACHE" => self.media.allow_cache = Some(value == "YES"),
            "EXT-X-DISCONTINUITY" => self.state.discontinuity = true,
            "EXT-X-GAP" => self.state.gap = true,
            "EXT-X-BYTERANGE" => {
                self.state.byte_range = Some(parse_byte_range(value).ok_or_else(|| {
                    NagareError::M3u8ParseError(format!("invalid byte range: {value}"))
                })?);
            }
            "EXT-X-PROGRAM-DATE-TIME" => self.state.date = parse_date(value),
            "EXT-X-KEY" => self.key(Attributes::parse(value))?,
            "EXT-X-MAP" => {
                let attributes = Attributes::parse(value);
                let Some(uri) = attributes.get("URI") else {
                    return Err(NagareError::M3u8ParseError(
                        "EXT-X-MAP without URI".to_string(),
                    ));
                };
                let byte_range = attributes
                    .get("BYTERANGE")
                    .and_then(parse_byte_range)
                    .map(|(length, offset)| ByteRange::new(offset.unwrap_or(0), Some(length)));
                self.state.map = Some(Map {
                    uri: self.resolve(uri)?,
                    byte_range,
                });
            }
            "EXT-X-START" => {
                let attributes = Attributes::parse(value);
                let start = attributes.f64("TIME-OFFSET").map(|time_offset| Start {
                    time_offset,
                    precise: attributes.bool("PRECISE"),
                });
                self.media.start = start;
                self.master.start = start;
            }
            "EXT-X-DATERANGE" => {
                let attributes = Attributes::parse(value);
                let client_attributes = attributes
                    .iter()
                    .filter(|(k, _)| k.starts_with("X-"))
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
                self.media.date_ranges.push(DateRange {
                    id: attributes.string("ID").unwrap_or_default(),
                    class: attributes.string("CLASS"),
                    start_date: attributes.date("START-DATE"),
                    end_date: attributes.date("END-DATE"),
                    duration: attributes.f64("DURATION"),
                    planned_duration: attributes.f64("PLANNED-DURATION"),
                    end_on_next: attributes.bool("END-ON-NEXT"),
                    client_attributes,
                });
            }
            "EXT-X-STREAM-INF" => {
                self.is_master = true;
                self.state.stream_inf = Some(Attributes::parse(value));
            }
            "EXT-X-I-FRAME-STREAM-INF" => {
                self.is_master = true;
                let attributes = Attributes::parse(value);
                if let Some(uri) = attributes.get("URI") {
                    let uri = self.resolve(uri)?;
                    let variant = variant_stream(uri, &attributes);
                    self.master.iframe_variants.push(variant);
                }
            }
            "EXT-X-MEDIA" => {
                let attributes = Attributes::parse(value);
                if let Some(media) = self.media_rendition(&attributes)? {
                    self.master.media.push(media);
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn key(&mut self, attributes: Attributes) -> NagareResult<()> {
        let method = KeyMethod::from(attributes.get("METHOD").unwrap_or("NONE"));
        let key = Key {
            uri: attributes
                .get("URI")
                .map(|uri| self.resolve(uri))
                .transpose()?,
            iv: attributes.get("IV").map(parse_iv).transpose()?,
            key_format: attributes.string("KEYFORMAT"),
            key_format_versions: attributes.string("KEYFORMATVERSIONS"),
            method,
        };

        // Several keys for different key systems may apply to the same segments;
        // the clear-key one wins.
        if self.state.key_declared
            && self.state.key.as_ref().is_some_and(Key::is_identity_format)
            && !key.is_identity_format()
        {
            return Ok(());
        }
        self.state.key_declared = true;
        self.state.key = match key.method {
            KeyMethod::None => None,
            _ => Some(key),
        };
        Ok(())
    }

    fn media_rendition(&self, attributes: &Attributes) -> NagareResult<Option<Media>> {
        let media_type = match attributes.get("TYPE") {
            Some("AUDIO") => MediaType::Audio,
            Some("VIDEO") => MediaType::Video,
            Some("SUBTITLES") => MediaType::Subtitles,
            Some("CLOSED-CAPTIONS") => MediaType::ClosedCaptions,
            _ => return Ok(None),
        };
        Ok(Some(Media {
            media_type,
            uri: attributes
                .get("URI")
                .map(|uri| self.resolve(uri))
                .transpose()?,
            group_id: attributes.string("GROUP-ID").unwrap_or_default(),
            language: attributes.string("LANGUAGE"),
            name: attributes.string("NAME").unwrap_or_default(),
            default: attributes.bool("DEFAULT"),
            autoselect: attributes.bool("AUTOSELECT"),
            channels: attributes.string("CHANNELS"),
        }))
    }

    fn uri(&mut self, line: &str) -> NagareResult<()> {
        let uri = self.resolve(line)?;

        if let Some(attributes) = self.state.stream_inf.take() {
            self.master.variants.push(variant_stream(uri, &attributes));
            return Ok(());
        }

        let state = &mut self.state;
        let (duration, title) = state.extinf.take().unwrap_or((0., None));
        let byte_range = state.byte_range.take().map(|(length, offset)| {
            let offset = offset.unwrap_or_else(|| {
                // continues the previous sub-range of the same resource
                self.media
                    .segments
                    .last()
                    .filter(|previous| previous.uri == uri)
                    .and_then(|previous| previous.byte_range)
                    .and_then(|range| range.end())
                    .unwrap_or(0)
            });
            ByteRange::new(offset, Some(length))
        });
        let date = state.date.take().or_else(|| {
            let previous = self.media.segments.last()?;
            let elapsed = TimeDelta::milliseconds((previous.duration * 1000.).round() as i64);
            previous.date.map(|date| date + elapsed)
        });

        self.media.segments.push(HlsSegment {
            uri,
            sequence: 0,
            duration,
            title,
            key: state.key.clone(),
            byte_range,
            map: state.map.clone(),
            discontinuity: std::mem::take(&mut state.discontinuity),
            date,
            gap: std::mem::take(&mut state.gap),
        });
        state.key_declared = false;
        Ok(())
    }

    fn finish(mut self) -> Playlist {
        if self.is_master {
            let media = &self.master.media;
            for variant in self.master.variants.iter_mut() {
                variant.media = media
                    .iter()
                    .filter(|m| {
                        let group = match m.media_type {
                            MediaType::Audio => &variant.audio,
                            MediaType::Video => &variant.video,
                            MediaType::Subtitles => &variant.subtitles,
                            MediaType::ClosedCaptions => return false,
                        };
                        group.as_deref() == Some(m.group_id.as_str())
                    })
                    .cloned()
                    .collect();
            }
            return Playlist::Master(self.master);
        }

        let media_sequence = self.media.media_sequence;
        for (index, segment) in self.media.segments.iter_mut().enumerate() {
            segment.sequence = media_sequence + index as u64;
        }
        Playlist::Media(self.media)
    }
}

fn variant_stream(uri: Url, attributes: &Attributes) -> VariantStream {
    VariantStream {
        uri,
        bandwidth: attributes.u64("BANDWIDTH").unwrap_or_default(),
        average_bandwidth: attributes.u64("AVERAGE-BANDWIDTH"),
        codecs: attributes.string("CODECS"),
        resolution: attributes.resolution("RESOLUTION"),
        frame_rate: attributes.f64("FRAME-RATE"),
        audio: attributes.string("AUDIO"),
        video: attributes.string("VIDEO"),
        subtitles: attributes.string("SUBTITLES"),
        media: Vec::new(),
    }
}
