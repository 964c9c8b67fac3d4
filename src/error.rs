use std::fmt;
use std::path::PathBuf;

use serde_derive::Deserialize;
use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid registry `{0}`")]
    InvalidRegistry(String),

    #[error("invalid repository `{0}`")]
    InvalidRepository(String),

    #[error("invalid tag `{0}`")]
    InvalidTag(String),

    #[error("invalid digest `{0}`")]
    InvalidDigest(String),

    #[error("expected size `{expected}` is not equal to the received size `{actual}`")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("expected digest `{expected}` is not equal to the calculated digest `{actual}`")]
    DigestMismatch { expected: String, actual: String },

    #[error("blob `{0}` does not exist in the layout")]
    BlobNotFound(String),

    #[error("no descriptor found for `{0}`")]
    DescriptorNotFound(String),

    #[error("unable to remove `{digest}`: {reason}")]
    UnableToRemove { digest: String, reason: String },

    #[error("unsupported manifest media type `{media_type}` received from `{location}`")]
    UnsupportedManifest { media_type: String, location: String },

    #[error("no manifest in the index matches the requested platform")]
    PlatformNotFound,

    #[error("invalid layout at `{path:?}`: {reason}")]
    InvalidLayout { path: PathBuf, reason: String },

    #[error("io failure")]
    Io(#[from] std::io::Error),

    #[error("transport failure")]
    Transport(#[from] hyper::Error),

    #[error("could not decode JSON")]
    Json(#[from] serde_json::Error),

    #[error("received unsuccessful response status `{status}`: {message}")]
    Http { status: u16, message: String },

    #[error("registry reported a failure: {0}")]
    Registry(FailureResponse),

    #[error("a concurrent transfer of `{0}` failed")]
    TransferFailed(String),

    #[error("reference `{0}` did not resolve to the pulled manifest")]
    IncompletePull(String),

    #[error("{0}")]
    Generic(String),
}

impl From<http::Error> for Error {
    fn from(err: http::Error) -> Self {
        Error::Generic(format!("could not construct request: {}", err))
    }
}

/// Error body returned by registries, per the distribution spec:
/// `{"errors":[{"code":…,"message":…,"detail":…}]}`.
#[derive(Debug, Deserialize)]
pub struct FailureResponse {
    pub errors: Vec<RegistryError>,
}

#[derive(Debug, Deserialize)]
pub struct RegistryError {
    pub code: String,
    pub message: Option<String>,
    pub detail: Option<serde_json::Value>,
}

impl fmt::Display for FailureResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for error in &self.errors {
            if !first {
                write!(f, ", ")?;
            }
            first = false;
            match &error.message {
                Some(message) => write!(f, "{} ({})", error.code, message)?,
                None => write!(f, "{}", error.code)?,
            }
        }
        Ok(())
    }
}
