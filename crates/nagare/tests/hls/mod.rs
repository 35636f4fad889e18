mod live;
mod variants;
mod vod;

use wiremock::{
    matchers::{method, path},
    Mock, MockServer, ResponseTemplate,
};

trait HlsMock {
    async fn mock<B>(&self, mock_path: &str, body: B) -> &Self
    where
        B: Into<Vec<u8>>;
}

impl HlsMock for MockServer {
    async fn mock<B>(&self, mock_path: &str, body: B) -> &Self
    where
        B: Into<Vec<u8>>,
    {
        Mock::given(method("GET"))
            .and(path(mock_path))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body))
            .mount(self)
            .await;
        self
    }
}

/// A media playlist listing `{sequence}.ts` segments of `duration` seconds.
fn media_playlist(target: u32, sequences: std::ops::Range<u64>, duration: f64, end: bool) -> String {
    let mut playlist = format!(
        "#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:{target}\n#EXT-X-MEDIA-SEQUENCE:{}\n",
        sequences.start
    );
    for sequence in sequences {
        playlist += &format!("#EXTINF:{duration:.3},\n{sequence}.ts\n");
    }
    if end {
        playlist += "#EXT-X-ENDLIST\n";
    }
    playlist
}
