mod dynamic;
mod r#static;
mod variants;

use wiremock::{
    matchers::{method, path},
    Mock, MockServer, ResponseTemplate,
};

trait DashMock {
    async fn mock<B>(&self, mock_path: &str, body: B) -> &Self
    where
        B: Into<Vec<u8>>;

    async fn mock_manifest(&self, mock_path: &str, mpd: &str) -> &Self;
}

impl DashMock for MockServer {
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

    async fn mock_manifest(&self, mock_path: &str, mpd: &str) -> &Self {
        Mock::given(method("GET"))
            .and(path(mock_path))
            .respond_with(ResponseTemplate::new(200).set_body_raw(mpd, "application/dash+xml"))
            .mount(self)
            .await;
        self
    }
}
