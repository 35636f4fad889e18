//! Turns HLS playlists and MPEG-DASH presentations into continuous byte streams.
//!
//! ```text
//! ┌──────────┐  segments  ┌──────────┐  fetch   ┌─────────────┐
//! │          ├────[MPSC]──►          ├──────────►  HTTP (xN)  │
//! │  Worker  │            │  Writer  ◄──────────┤             │
//! │          │            │          │  bodies  └─────────────┘
//! └────▲─────┘            └────┬─────┘  in order
//!      │ reload                │ write
//!      │                  ┌────▼─────┐   read   ┌─────────────┐
//!  manifest               │RingBuffer├──────────►   Reader    │
//!                         └──────────┘          └─────────────┘
//! ```

pub mod dash;
pub mod decrypt;
pub mod error;
pub mod fetch;
pub mod hls;
pub mod options;
pub mod ringbuffer;
pub mod stream;
pub mod util;

use std::collections::BTreeMap;

use reqwest::Url;

pub use dash::{open_dash, parse_dash_variants, DashStream};
pub use error::{NagareError, NagareResult};
pub use hls::{open_hls, parse_hls_variants, HlsStream};
pub use options::{DashParams, HlsParams, StreamOptions, VariantOptions};
pub use stream::{Reader, Stream, StreamOutput};
pub use util::{detect_manifest_type, http::HttpClient, ManifestType};

/// A stream found by [`parse_variants`], either HLS or DASH.
#[derive(Clone)]
pub enum StreamVariant {
    Hls(HlsStream),
    Dash(DashStream),
}

impl Stream for StreamVariant {
    fn url(&self) -> &Url {
        match self {
            StreamVariant::Hls(stream) => stream.url(),
            StreamVariant::Dash(stream) => stream.url(),
        }
    }

    async fn open(&self) -> NagareResult<StreamOutput> {
        match self {
            StreamVariant::Hls(stream) => stream.open().await,
            StreamVariant::Dash(stream) => stream.open().await,
        }
    }
}

/// Lists the named streams of the manifest at `url`, detecting whether it is
/// an HLS playlist or a DASH presentation first.
pub async fn parse_variants(
    client: &HttpClient,
    url: &Url,
    hls_params: HlsParams,
    dash_params: DashParams,
    options: StreamOptions,
    variant_options: &VariantOptions,
) -> NagareResult<BTreeMap<String, StreamVariant>> {
    let probe = client.with_request_args(&options.headers, &options.params)?;
    let manifest_type = detect_manifest_type(url, &probe).await?;
    tracing::debug!(%url, ?manifest_type, "Detected manifest type");

    let variants = match manifest_type {
        ManifestType::Hls => {
            parse_hls_variants(client, url, hls_params, options, variant_options)
                .await?
                .into_iter()
                .map(|(name, stream)| (name, StreamVariant::Hls(stream)))
                .collect()
        }
        ManifestType::Dash => {
            parse_dash_variants(client, url, dash_params, options, variant_options)
                .await?
                .into_iter()
                .map(|(name, stream)| (name, StreamVariant::Dash(stream)))
                .collect()
        }
    };
    Ok(variants)
}
