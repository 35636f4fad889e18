use std::{collections::HashMap, future::Future, ops::Deref, sync::Arc};

use bytes::Bytes;
use reqwest::{
    header::{HeaderMap, HeaderName, HeaderValue, RANGE},
    Client, ClientBuilder, IntoUrl, RequestBuilder, Response, Url,
};
use reqwest_cookie_store::{CookieStore, CookieStoreMutex};

use crate::{
    error::{NagareError, NagareResult},
    options::RetryPolicy,
    util::range::ByteRange,
};

/// Shared HTTP session used for manifests, keys and segments.
///
/// Cloning is cheap: the connection pool and the cookie store are shared.
#[derive(Clone)]
pub struct HttpClient {
    client: Client,
    cookies_store: Arc<CookieStoreMutex>,
    headers: HeaderMap,
    params: Vec<(String, String)>,
}

impl HttpClient {
    pub fn new(builder: ClientBuilder) -> NagareResult<Self> {
        let cookies_store = Arc::new(CookieStoreMutex::new(CookieStore::default()));
        let client = builder.cookie_provider(cookies_store.clone()).build()?;

        Ok(Self {
            client,
            cookies_store,
            headers: HeaderMap::new(),
            params: Vec::new(),
        })
    }

    pub fn add_cookies(&self, cookies: Vec<String>, url: impl IntoUrl) -> NagareResult<()> {
        let url = url.into_url()?;
        let mut lock = self
            .cookies_store
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for cookie in cookies {
            if let Err(e) = lock.parse(&cookie, &url) {
                tracing::warn!(%url, "Ignored invalid cookie: {e}");
            }
        }
        Ok(())
    }

    /// Returns a session sharing this one's pool and cookies, sending `headers`
    /// and `params` with every request in addition to the current ones.
    pub fn with_request_args(
        &self,
        headers: &HashMap<String, String>,
        params: &HashMap<String, String>,
    ) -> NagareResult<Self> {
        let mut client = self.clone();
        for (name, value) in headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| NagareError::InvalidHeader(name.clone()))?;
            let value =
                HeaderValue::from_str(value).map_err(|_| NagareError::InvalidHeader(value.clone()))?;
            client.headers.insert(name, value);
        }
        client
            .params
            .extend(params.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(client)
    }

    /// A GET request carrying the session's request arguments.
    pub fn request(&self, url: Url) -> RequestBuilder {
        let mut request = self.client.get(url).headers(self.headers.clone());
        if !self.params.is_empty() {
            request = request.query(&self.params);
        }
        request
    }

    /// Sends a GET, optionally restricted to `range`, and fails on non-success statuses.
    pub async fn fetch(
        &self,
        url: &Url,
        range: Option<&ByteRange>,
        policy: &RetryPolicy,
    ) -> NagareResult<Response> {
        let mut request = self.request(url.clone()).timeout(policy.timeout);
        if let Some(range) = range {
            request = request.header(RANGE, range.to_http_range());
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            let status = response.status();
            if let Ok(body) = response.text().await {
                tracing::debug!(%url, "Error body: {body}");
            }
            return Err(NagareError::http(status, url));
        }
        Ok(response)
    }

    /// Fetches a manifest body with retries. Returns the final URL after
    /// redirects, which relative references must be resolved against.
    pub async fn get_text(&self, url: &Url, policy: &RetryPolicy) -> NagareResult<(Url, String)> {
        with_retry(policy, url.as_str(), || async move {
            let response = self.fetch(url, None, policy).await?;
            let final_url = response.url().clone();
            Ok((final_url, response.text().await?))
        })
        .await
    }

    pub async fn get_bytes(
        &self,
        url: &Url,
        range: Option<&ByteRange>,
        policy: &RetryPolicy,
    ) -> NagareResult<Bytes> {
        with_retry(policy, url.as_str(), || async move {
            Ok(self.fetch(url, range, policy).await?.bytes().await?)
        })
        .await
    }
}

impl Default for HttpClient {
    /// A session with reqwest's default settings and its own cookie store.
    ///
    /// # Panics
    ///
    /// Panics if the TLS backend cannot be initialized, like
    /// [`Client::new`]. Use [`HttpClient::new`] to handle that error.
    fn default() -> Self {
        match Self::new(Client::builder()) {
            Ok(client) => client,
            Err(e) => panic!("failed to initialize the HTTP client: {e}"),
        }
    }
}

impl Deref for HttpClient {
    type Target = Client;

    fn deref(&self) -> &Self::Target {
        &self.client
    }
}

/// Runs `f` until it succeeds, fails permanently or exhausts `policy.attempts`,
/// sleeping with exponential backoff between transient failures.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, what: &str, mut f: F) -> NagareResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = NagareResult<T>>,
{
    let mut attempt = 0;
    loop {
        match f().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt + 1 < policy.attempts => {
                let delay = policy.delay(attempt);
                tracing::warn!(
                    attempt = attempt + 1,
                    attempts = policy.attempts,
                    "Failed to fetch {what}: {e}. Retrying in {delay:?}"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
