use std::path::PathBuf;

/// Main library error type.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Candle(#[from] candle::Error),

    #[error("{path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse {path:?}: {source}")]
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("hub error for {repo}: {source}")]
    Hub {
        repo: String,
        source: hf_hub::api::sync::ApiError,
    },

    #[error("tokenizer: {0}")]
    Tokenizer(String),

    #[error("chat template: {0}")]
    Template(#[from] minijinja::Error),

    #[error("fetching {url}: {source}")]
    Http {
        url: String,
        source: reqwest::Error,
    },

    #[error("audio: {0}")]
    Audio(String),

    #[error("unsupported low-bit mode {name:?}, expected one of: {supported}")]
    UnsupportedLowBit { name: String, supported: String },

    /// The audio placeholders in the prompt do not line up with the provided audio.
    #[error("prompt holds {placeholders} audio placeholders but {audios} audio inputs were given")]
    AudioCountMismatch { placeholders: usize, audios: usize },

    #[error("{0}")]
    Msg(String),
}

impl Error {
    pub fn msg(msg: impl std::fmt::Display) -> Self {
        Self::Msg(msg.to_string())
    }

    pub(crate) fn io(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> Self {
        let path = path.into();
        move |source| Self::Io { path, source }
    }

    pub(crate) fn json(path: impl Into<PathBuf>) -> impl FnOnce(serde_json::Error) -> Self {
        let path = path.into();
        move |source| Self::Json { path, source }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[macro_export]
macro_rules! bail {
    ($msg:literal $(,)?) => {
        return Err($crate::Error::Msg(format!($msg)))
    };
    ($fmt:expr, $($arg:tt)*) => {
        return Err($crate::Error::Msg(format!($fmt, $($arg)*)))
    };
}
