use crossbeam_channel::Sender;
use once_cell::sync::OnceCell;

pub const APP_TITLE: &str = "Selection Translator";

/// Everything the background threads want the UI thread to show.
#[derive(Debug, Clone, PartialEq)]
pub enum UiEvent {
    ShowSettings,
    /// A run started (`Some(id)`) or finished (`None`).
    Busy(Option<u64>),
    Status { run: u64, text: String },
    Progress { run: u64, percent: Option<u8> },
    Detail { run: u64, text: String },
    Download { in_progress: bool, status: String, percent: Option<u8> },
}

/// How a run reports back: errors to the user, the rest to the overlay.
pub trait Feedback {
    fn error(&self, message: &str);
    fn busy(&self, _on: bool) {}
    fn status(&self, _text: &str) {}
    fn progress(&self, _percent: Option<u8>) {}
    fn partial(&self, _text_so_far: &str) {}
    fn download(&self, _in_progress: bool, _status: &str, _percent: Option<u8>) {}
}

static UI_CONTEXT: OnceCell<egui::Context> = OnceCell::new();

/// Lets background threads wake the UI loop after queueing an event.
pub fn set_ui_context(ctx: egui::Context) {
    let _ = UI_CONTEXT.set(ctx);
}

pub fn send_ui(tx: &Sender<UiEvent>, event: UiEvent) {
    if tx.send(event).is_err() {
        log::debug!("UI channel closed; event dropped");
        return;
    }
    if let Some(ctx) = UI_CONTEXT.get() {
        ctx.request_repaint();
    }
}

pub fn toast(title: &str, body: &str) {
    #[cfg(windows)]
    {
        if let Err(e) = winrt_notification::Toast::new(winrt_notification::Toast::POWERSHELL_APP_ID)
            .title(title)
            .text1(body)
            .show()
        {
            log::warn!("Toast failed: {:?}", e);
        }
    }
    #[cfg(not(windows))]
    {
        log::info!("[toast] {}: {}", title, body);
    }
}

#[cfg(windows)]
pub fn show_message_box(title: &str, text: &str) {
    use std::ffi::OsStr;
    use std::os::windows::ffi::OsStrExt;
    use windows::Win32::Foundation::HWND;
    use windows::Win32::UI::WindowsAndMessaging as wm;
    fn wide(s: &str) -> Vec<u16> {
        OsStr::new(s).encode_wide().chain(std::iter::once(0)).collect()
    }
    unsafe {
        let _ = wm::MessageBoxW(
            HWND(std::ptr::null_mut()),
            windows::core::PCWSTR(wide(text).as_ptr()),
            windows::core::PCWSTR(wide(title).as_ptr()),
            wm::MB_OK | wm::MB_ICONERROR | wm::MB_TOPMOST | wm::MB_SETFOREGROUND,
        );
    }
}

#[cfg(not(windows))]
pub fn show_message_box(title: &str, text: &str) {
    eprintln!("{}: {}", title, text);
}

/// Errors go to a toast, everything else to the UI channel tagged with the current run.
pub struct UiFeedback {
    tx: Sender<UiEvent>,
    run: u64,
}

impl UiFeedback {
    pub fn new(tx: Sender<UiEvent>, run: u64) -> Self {
        Self { tx, run }
    }
}

impl Feedback for UiFeedback {
    fn error(&self, message: &str) {
        log::error!("{}", message);
        toast("Translator Error", message);
    }

    fn busy(&self, on: bool) {
        send_ui(&self.tx, UiEvent::Busy(on.then_some(self.run)));
    }

    fn status(&self, text: &str) {
        send_ui(&self.tx, UiEvent::Status { run: self.run, text: text.to_string() });
    }

    fn progress(&self, percent: Option<u8>) {
        send_ui(&self.tx, UiEvent::Progress { run: self.run, percent });
    }

    fn partial(&self, text_so_far: &str) {
        send_ui(&self.tx, UiEvent::Detail { run: self.run, text: partial_detail(text_so_far) });
    }

    fn download(&self, in_progress: bool, status: &str, percent: Option<u8>) {
        send_ui(
            &self.tx,
            UiEvent::Download { in_progress, status: status.to_string(), percent },
        );
    }
}

/// `"<N> chars - <last 80 chars on one line>"`
pub fn partial_detail(text_so_far: &str) -> String {
    let count = text_so_far.chars().count();
    let tail: String = text_so_far.chars().skip(count.saturating_sub(80)).collect();
    format!("{} chars - {}", count, tail.replace('\n', " ").trim())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_detail_keeps_tail_on_one_line() {
        assert_eq!(partial_detail("Bon\njour "), "9 chars - Bon jour");

        let long = "é".repeat(100);
        let detail = partial_detail(&long);
        assert!(detail.starts_with("100 chars - "));
        assert_eq!(detail.trim_start_matches("100 chars - ").chars().count(), 80);
    }

    #[test]
    fn ui_feedback_tags_events_with_run() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let fb = UiFeedback::new(tx, 7);
        fb.busy(true);
        fb.status("Downloading model: m");
        fb.progress(Some(40));
        fb.busy(false);

        let events: Vec<UiEvent> = rx.try_iter().collect();
        assert_eq!(
            events,
            vec![
                UiEvent::Busy(Some(7)),
                UiEvent::Status { run: 7, text: "Downloading model: m".to_string() },
                UiEvent::Progress { run: 7, percent: Some(40) },
                UiEvent::Busy(None),
            ]
        );
    }
}
