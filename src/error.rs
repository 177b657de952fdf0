use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum PopulateError {
    #[error("unknown entity kind: {0}")]
    InvalidKind(String),

    #[error("missing settings file at {0}")]
    MissingConfig(PathBuf),

    #[error("failed to read settings file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse settings: {0}")]
    ConfigParse(String),

    #[error("missing required setting: {0}")]
    MissingSetting(&'static str),

    #[error("missing CSV file: {0}")]
    MissingCsv(PathBuf),

    #[error("failed to read CSV {path}: {message}")]
    Csv { path: PathBuf, message: String },

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("cannot overwrite cached data at {0}")]
    CacheEntryExists(String),

    #[error("scamplers request failed: {0}")]
    ApiHttp(String),

    #[error("scamplers returned status {status}: {message}")]
    ApiStatus { status: u16, message: String },

    #[error("unexpected response from scamplers: {0}")]
    ApiDecode(String),

    #[error("{property} is not unique: {value}")]
    DuplicateKey { property: String, value: String },

    #[error("invalid regular expression: {0}")]
    InvalidPattern(String),

    #[error("invalid dataset directory {path}: {message}")]
    InvalidDataset { path: PathBuf, message: String },
}

/// Why a single spreadsheet row could not be turned into a request.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RowError {
    #[error("missing value for `{0}`")]
    MissingField(String),

    #[error("`{field}` has invalid value {value:?}: {message}")]
    InvalidValue {
        field: String,
        value: String,
        message: String,
    },

    #[error("no {what} found for {key:?}")]
    UnresolvedReference { what: &'static str, key: String },

    #[error("{0}")]
    Inconsistent(String),
}

impl RowError {
    pub fn invalid(field: &str, value: &str, message: impl Into<String>) -> Self {
        Self::InvalidValue {
            field: field.to_string(),
            value: value.to_string(),
            message: message.into(),
        }
    }

    pub fn unresolved(what: &'static str, key: &str) -> Self {
        Self::UnresolvedReference {
            what,
            key: key.to_string(),
        }
    }
}
