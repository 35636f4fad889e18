use std::fmt;

/// A sub-range of a resource, fetched with an HTTP `Range` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ByteRange {
    pub offset: u64,
    pub length: Option<u64>,
}

impl ByteRange {
    pub fn new(offset: u64, length: Option<u64>) -> Self {
        Self { offset, length }
    }

    /// First byte after the range, if the range is bounded.
    pub fn end(&self) -> Option<u64> {
        self.length.map(|length| self.offset + length)
    }

    pub fn to_http_range(&self) -> String {
        match self.length {
            Some(0) | None => format!("bytes={}-", self.offset),
            Some(length) => format!("bytes={}-{}", self.offset, self.offset + length - 1),
        }
    }
}

impl fmt::Display for ByteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.length {
            Some(length) => write!(f, "{length}@{}", self.offset),
            None => write!(f, "{}-", self.offset),
        }
    }
}
