use crate::{
    dash::timeline::DashSegment,
    error::NagareResult,
    fetch::{fetch_segment, write_body, SegmentBody},
    options::RetryPolicy,
    ringbuffer::RingBuffer,
    stream::segmented::SegmentedWriter,
    util::http::HttpClient,
};

/// Downloads DASH segments and initialization sections.
pub struct DashSegmentWriter {
    client: HttpClient,
    policy: RetryPolicy,
}

impl DashSegmentWriter {
    pub fn new(client: HttpClient, policy: RetryPolicy) -> Self {
        Self { client, policy }
    }
}

impl SegmentedWriter for DashSegmentWriter {
    type Segment = DashSegment;
    type Fetched = SegmentBody;

    async fn fetch(&self, segment: &DashSegment) -> NagareResult<Option<SegmentBody>> {
        let body = fetch_segment(
            &self.client,
            &segment.uri,
            segment.byte_range.as_ref(),
            &self.policy,
            false,
        )
        .await
        .inspect_err(|e| {
            if segment.init {
                tracing::error!(uri = %segment.uri, "Failed to fetch initialization section: {e}");
            }
        })?;
        Ok(Some(body))
    }

    async fn write(
        &self,
        segment: &DashSegment,
        body: SegmentBody,
        buffer: &RingBuffer,
    ) -> NagareResult<()> {
        match write_body(body, None, buffer).await {
            Ok(written) => {
                tracing::trace!(number = segment.number, init = segment.init, written, "Segment written");
            }
            Err(e) => {
                tracing::error!(number = segment.number, "Failed to write segment: {e}");
            }
        }
        Ok(())
    }
}
