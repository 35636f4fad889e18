use nagare::{
    parse_variants, DashParams, HlsParams, HttpClient, Stream, StreamOptions, StreamOutput,
    VariantOptions,
};
use reqwest::Url;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(tracing::Level::INFO)
        .init();

    let url = std::env::args().nth(1).unwrap_or_else(|| {
        eprintln!("Usage: pipe <m3u8_or_mpd_url> [stream_name]");
        std::process::exit(1);
    });
    let name = std::env::args().nth(2).unwrap_or_else(|| "best".to_string());

    let options = StreamOptions {
        segment_threads: 4,
        ..Default::default()
    };
    let variants = parse_variants(
        &HttpClient::default(),
        &Url::parse(&url)?,
        HlsParams::default(),
        DashParams::default(),
        options,
        &VariantOptions::default(),
    )
    .await?;

    let Some(stream) = variants.get(&name) else {
        let names: Vec<_> = variants.keys().map(String::as_str).collect();
        anyhow::bail!("stream {name} not found, available: {}", names.join(", "));
    };
    tracing::info!(url = %stream.url(), "Opening {name}");

    let mut reader = match stream.open().await? {
        StreamOutput::Single(reader) => reader,
        StreamOutput::Muxed { video, audio } => {
            tracing::warn!("Writing video only, {} audio stream(s) need a muxer", audio.len());
            video
        }
    };

    let copied = tokio::task::spawn_blocking(move || {
        let mut stdout = std::io::stdout().lock();
        let copied = std::io::copy(&mut reader, &mut stdout);
        (copied, reader.error())
    })
    .await?;
    match copied {
        (Ok(bytes), None) => tracing::info!(bytes, "Stream ended"),
        (Ok(bytes), Some(e)) => anyhow::bail!("stream failed after {bytes} bytes: {e}"),
        (Err(e), _) => return Err(e.into()),
    }

    Ok(())
}
