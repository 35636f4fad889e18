use bytes::Bytes;
use futures::{stream::BoxStream, StreamExt, TryStreamExt};
use reqwest::{Response, Url};

use crate::{
    decrypt::StreamDecryptor,
    error::{NagareError, NagareResult},
    options::RetryPolicy,
    ringbuffer::RingBuffer,
    util::{
        http::{with_retry, HttpClient},
        range::ByteRange,
    },
};

/// A fetched segment: fully downloaded, or a response whose body is read while
/// it is written out.
pub enum SegmentBody {
    Complete(Bytes),
    Streaming(Response),
}

impl SegmentBody {
    pub fn into_stream(self) -> BoxStream<'static, NagareResult<Bytes>> {
        match self {
            SegmentBody::Complete(bytes) => futures::stream::once(async move { Ok(bytes) }).boxed(),
            SegmentBody::Streaming(response) => {
                response.bytes_stream().map_err(NagareError::from).boxed()
            }
        }
    }
}

/// Fetches `url` (restricted to `range`) with the segment retry policy.
///
/// With `stream`, only the response head is awaited here so that the body can
/// be consumed by [`write_body`].
pub async fn fetch_segment(
    client: &HttpClient,
    url: &Url,
    range: Option<&ByteRange>,
    policy: &RetryPolicy,
    stream: bool,
) -> NagareResult<SegmentBody> {
    with_retry(policy, url.as_str(), || async move {
        let response = client.fetch(url, range, policy).await?;
        if stream {
            Ok(SegmentBody::Streaming(response))
        } else {
            Ok(SegmentBody::Complete(response.bytes().await?))
        }
    })
    .await
}

/// Writes `data` to `buffer`. Returns `false` if the buffer was closed meanwhile.
pub async fn write_chunk(buffer: &RingBuffer, data: &[u8]) -> bool {
    data.is_empty() || buffer.write_async(data).await == data.len()
}

/// Copies a segment body into `buffer`, decrypting it on the way if needed.
///
/// Returns the number of bytes written. A closed buffer ends the copy early
/// without an error.
pub async fn write_body(
    body: SegmentBody,
    mut decryptor: Option<StreamDecryptor>,
    buffer: &RingBuffer,
) -> NagareResult<usize> {
    let mut written = 0;
    let mut chunks = body.into_stream();
    while let Some(chunk) = chunks.next().await {
        let chunk = chunk?;
        let data = match decryptor.as_mut() {
            Some(decryptor) => decryptor.update(&chunk),
            None => chunk.to_vec(),
        };
        if !write_chunk(buffer, &data).await {
            return Ok(written);
        }
        written += data.len();
    }

    if let Some(decryptor) = decryptor {
        let tail = decryptor.finish()?;
        if !write_chunk(buffer, &tail).await {
            return Ok(written);
        }
        written += tail.len();
    }
    Ok(written)
}
