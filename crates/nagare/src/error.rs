use aes::cipher::block_padding::UnpadError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum NagareError {
    #[error("HTTP error: {status} for {url}")]
    HttpError {
        status: reqwest::StatusCode,
        url: String,
    },

    #[error("Invalid m3u8 file: {0}")]
    M3u8ParseError(String),

    #[error("Invalid MPD file: {0}")]
    MpdParseError(String),

    #[error("Unsupported encryption method: {0}")]
    UnsupportedEncryption(String),

    #[error("Stream is protected by DRM: {0}")]
    DrmProtected(String),

    #[error("Invalid AES-128 key: {0:?}")]
    InvalidAes128Key(Vec<u8>),

    #[error("Invalid IV: {0}")]
    InvalidIv(String),

    #[error("Ciphertext of {0} bytes is not aligned to the AES block size")]
    NotBlockAligned(usize),

    #[error("Pkcs7 unpad error")]
    UnpadError(#[from] UnpadError),

    #[error("Failed to reload playlist after {0} attempt(s)")]
    PlaylistReloadFailed(u32),

    #[error("No new segments for {0:.1}s, stopping")]
    StreamStalled(f64),

    #[error("No variants found in master playlist")]
    NoVariants,

    #[error("Stream not found: {0}")]
    StreamNotFound(String),

    #[error("No representation found: {0}")]
    NoRepresentationFound(String),

    #[error("Invalid request header: {0}")]
    InvalidHeader(String),

    #[error("Read timeout")]
    ReadTimeout,

    #[error("Invalid timing schema: {0:?}")]
    InvalidTimingSchema(String),

    #[error(transparent)]
    IOError(#[from] std::io::Error),

    #[error(transparent)]
    UrlParseError(#[from] url::ParseError),

    #[error(transparent)]
    HexDecodeError(#[from] hex::FromHexError),

    #[error(transparent)]
    RequestError(#[from] reqwest::Error),

    #[error(transparent)]
    XmlError(#[from] quick_xml::Error),

    #[error(transparent)]
    RegexError(#[from] regex::Error),
}

impl NagareError {
    pub fn http(status: reqwest::StatusCode, url: impl ToString) -> Self {
        Self::HttpError {
            status,
            url: url.to_string(),
        }
    }

    /// Whether retrying the same request may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::HttpError { status, .. } => {
                status.is_server_error() || *status == reqwest::StatusCode::TOO_MANY_REQUESTS
            }
            Self::RequestError(e) => {
                e.is_timeout() || e.is_connect() || e.is_request() || e.is_body() || e.is_decode()
            }
            Self::IOError(_) => true,
            _ => false,
        }
    }
}

pub type NagareResult<T> = Result<T, NagareError>;
