use thiserror::Error;

#[derive(Debug, Error)]
pub enum TranslateError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error {status}: {body}")]
    Api { status: u16, body: String },

    #[error("model '{0}' is not available on the server")]
    ModelNotFound(String),

    #[error("empty response from the server")]
    EmptyResponse,

    #[error("malformed response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("invalid base URL: {0}")]
    InvalidBaseUrl(String),

    #[error("clipboard: {0}")]
    Clipboard(String),

    #[error("keyboard simulation: {0}")]
    Input(String),

    #[error("no data from the server for {0:?}")]
    Timeout(std::time::Duration),

    #[error("{0} is not supported on this platform")]
    Unsupported(&'static str),
}

impl TranslateError {
    pub fn is_model_not_found(&self) -> bool {
        matches!(self, TranslateError::ModelNotFound(_))
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HotkeyError {
    #[error("hotkey is empty")]
    Empty,

    #[error("could not parse hotkey '{0}': no main key found")]
    NoMainKey(String),

    #[error("RegisterHotKey failed for '{0}' (is it used by another program?)")]
    Register(String),

    #[error("hotkey thread did not report back in time")]
    Timeout,

    #[error("global hotkeys are not supported on this platform")]
    Unsupported,
}
