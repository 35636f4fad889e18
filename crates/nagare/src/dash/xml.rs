use std::collections::HashMap;

use quick_xml::{
    events::{BytesStart, Event},
    Reader,
};

use crate::error::{NagareError, NagareResult};

/// An XML element with namespace prefixes stripped from element and attribute
/// names, so `<mpd:MPD xlink:href="..">` reads as `MPD` with an `href` attribute.
#[derive(Debug, Clone, Default)]
pub struct Element {
    pub name: String,
    pub attributes: HashMap<String, String>,
    pub children: Vec<Element>,
    pub text: String,
}

impl Element {
    pub fn parse(text: &str) -> NagareResult<Self> {
        let mut reader = Reader::from_str(text);
        reader.config_mut().trim_text(true);

        let mut stack: Vec<Element> = Vec::new();
        let mut root = None;
        loop {
            match reader.read_event()? {
                Event::Start(start) => stack.push(Self::open(&start)?),
                Event::Empty(start) => {
                    let element = Self::open(&start)?;
                    match stack.last_mut() {
                        Some(parent) => parent.children.push(element),
                        None => root = Some(element),
                    }
                }
                Event::End(_) => {
                    let element = stack.pop().ok_or_else(|| {
                        NagareError::MpdParseError("unbalanced closing tag".to_string())
                    })?;
                    match stack.last_mut() {
                        Some(parent) => parent.children.push(element),
                        None => root = Some(element),
                    }
                }
                Event::Text(text) => {
                    if let Some(element) = stack.last_mut() {
                        element.text.push_str(&text.unescape()?);
                    }
                }
                Event::CData(data) => {
                    if let Some(element) = stack.last_mut() {
                        element
                            .text
                            .push_str(&String::from_utf8_lossy(&data.into_inner()));
                    }
                }
                Event::Eof => break,
                _ => {}
            }
        }

        if !stack.is_empty() {
            return Err(NagareError::MpdParseError(format!(
                "unclosed element <{}>",
                stack[stack.len() - 1].name
            )));
        }
        root.ok_or_else(|| NagareError::MpdParseError("empty document".to_string()))
    }

    fn open(start: &BytesStart) -> NagareResult<Self> {
        let mut attributes = HashMap::new();
        for attr in start.attributes() {
            let attr = attr.map_err(quick_xml::Error::from)?;
            if attr.key.as_namespace_binding().is_some() {
                continue;
            }
            let key = String::from_utf8_lossy(attr.key.local_name().as_ref()).into_owned();
            attributes.insert(key, attr.unescape_value()?.into_owned());
        }

        Ok(Self {
            name: String::from_utf8_lossy(start.local_name().as_ref()).into_owned(),
            attributes,
            children: Vec::new(),
            text: String::new(),
        })
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }

    /// Parses an attribute, treating an unparsable value as a manifest error.
    pub fn parse_attr<T: std::str::FromStr>(&self, name: &str) -> NagareResult<Option<T>> {
        self.attr(name)
            .map(|value| {
                value.trim().parse().map_err(|_| {
                    NagareError::MpdParseError(format!(
                        "invalid {}@{name}: {value:?}",
                        self.name
                    ))
                })
            })
            .transpose()
    }

    pub fn child(&self, name: &str) -> Option<&Element> {
        self.children.iter().find(|c| c.name == name)
    }

    pub fn children<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Element> + 'a {
        self.children.iter().filter(move |c| c.name == name)
    }

    pub fn text(&self) -> &str {
        self.text.trim()
    }
}
