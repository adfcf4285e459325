use thiserror::Error;

/// Errors raised while exchanging or refreshing credentials.
#[derive(Error, Debug)]
pub enum AuthnError {
    #[error("authentication request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("authentication rejected: {0}")]
    Rejected(String),
    #[error("basic auth not authorized from current network location")]
    NotAuthorizedFromIp,
}

/// Errors raised by the session/config token store.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("failed to read session store at {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write session store at {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse session store: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("could not determine a config directory for this user")]
    NoConfigDir,
    #[error("token is malformed: {0}")]
    MalformedToken(String),
}

/// Errors raised by the SQLite-backed request cache.
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("cannot access request cache: {0}")]
    Connection(String),
    #[error("could not create request cache for {key}: {source}")]
    Creation { key: String, source: String },
    #[error("{item} already cached for {key}")]
    DuplicateItem { key: String, item: String },
    #[error("{source}, call: create(key='{key}')")]
    Existence { key: String, source: String },
    #[error("could not destroy cache for {key}: {source}")]
    Destroy { key: String, source: String },
}

/// Errors raised by the crypto helper.
#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("server public key is malformed: {0}")]
    MalformedPublicKey(String),
    #[error("failed to seal per-chunk key material: {0}")]
    Seal(String),
    #[error("failed to decode base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),
}

/// Top-level error type returned by every core transfer operation.
#[derive(Error, Debug)]
pub enum TaclError {
    #[error(transparent)]
    Authn(#[from] AuthnError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("http request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid url: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("local filesystem error: {0}")]
    Io(#[from] std::io::Error),

    #[error("server rejected the request with status {status}: {message}")]
    Http4xx { status: u16, message: String },

    #[error("server error {status} persisted after exhausting retries")]
    RetriesExhausted { status: u16 },

    #[error(
        "cannot resume upload - client/server chunks do not match (expected md5 {expected}, got {actual})"
    )]
    ResumeIntegrityMismatch { expected: String, actual: String },

    #[error("server did not return a resumable id on the first chunk")]
    MissingResumableId,

    #[error("local file {0} not found, skipping")]
    LocalFileMissing(String),

    #[error("{0}")]
    Other(String),
}

impl TaclError {
    /// Whether this error was already retried by the transport layer and exhausted,
    /// i.e. the caller should treat it as terminal rather than attempt another pass.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TaclError::Http4xx { .. }
                | TaclError::RetriesExhausted { .. }
                | TaclError::ResumeIntegrityMismatch { .. }
                | TaclError::Authn(_)
        )
    }

    /// Whether the directory transporter may log this error and continue with the
    /// next resource instead of aborting the whole operation (see the single
    /// documented skippable case: a local file vanishing before its own upload).
    pub fn is_skippable_in_directory_transfer(&self) -> bool {
        matches!(self, TaclError::LocalFileMissing(_))
    }
}

pub type TaclResult<T> = Result<T, TaclError>;
