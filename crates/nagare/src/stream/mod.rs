use std::future::Future;

use reqwest::Url;

use crate::error::NagareResult;

pub mod reader;
pub mod segmented;

pub use reader::Reader;

/// Readers returned by opening a stream.
pub enum StreamOutput {
    Single(Reader),
    /// A video reader and separately selected audio readers, to be interleaved
    /// by an external muxer.
    Muxed { video: Reader, audio: Vec<Reader> },
}

impl StreamOutput {
    /// The video reader, or the only reader.
    pub fn primary(&self) -> &Reader {
        match self {
            StreamOutput::Single(reader) => reader,
            StreamOutput::Muxed { video, .. } => video,
        }
    }

    pub fn into_readers(self) -> Vec<Reader> {
        match self {
            StreamOutput::Single(reader) => vec![reader],
            StreamOutput::Muxed { video, mut audio } => {
                audio.insert(0, video);
                audio
            }
        }
    }
}

/// A selectable stream that turns into byte readers when opened.
pub trait Stream {
    fn url(&self) -> &Url;

    fn open(&self) -> impl Future<Output = NagareResult<StreamOutput>> + Send;
}
