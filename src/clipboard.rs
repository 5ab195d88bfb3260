use crate::error::TranslateError;

pub trait Clipboard {
    /// `None` when the clipboard holds no text or cannot be opened.
    fn read(&self) -> Option<String>;
    fn write(&self, text: &str) -> Result<(), TranslateError>;
}

/// The Windows clipboard.
pub struct SystemClipboard;

impl Clipboard for SystemClipboard {
    fn read(&self) -> Option<String> {
        #[cfg(windows)]
        {
            clipboard_win::get_clipboard_string().ok()
        }
        #[cfg(not(windows))]
        {
            None
        }
    }

    fn write(&self, text: &str) -> Result<(), TranslateError> {
        #[cfg(windows)]
        {
            clipboard_win::set_clipboard_string(text)
                .map_err(|e| TranslateError::Clipboard(e.to_string()))
        }
        #[cfg(not(windows))]
        {
            let _ = text;
            Err(TranslateError::Unsupported("clipboard access"))
        }
    }
}
