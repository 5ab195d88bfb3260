use std::sync::{mpsc, Arc};
use std::time::Duration;

use crate::error::HotkeyError;

pub const MOD_ALT: u32 = 0x0001;
pub const MOD_CONTROL: u32 = 0x0002;
pub const MOD_SHIFT: u32 = 0x0004;
pub const MOD_WIN: u32 = 0x0008;

/// Modifier flags and virtual-key code as `RegisterHotKey` expects them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hotkey {
    pub modifiers: u32,
    pub vk: u32,
}

fn modifier_flag(name: &str) -> Option<u32> {
    let name = name
        .strip_prefix("left ")
        .or_else(|| name.strip_prefix("right "))
        .unwrap_or(name);
    match name {
        "ctrl" | "control" => Some(MOD_CONTROL),
        "alt" => Some(MOD_ALT),
        "shift" => Some(MOD_SHIFT),
        "win" | "windows" => Some(MOD_WIN),
        _ => None,
    }
}

// Virtual-key codes are layout independent, so "t" stays the T key on any keyboard layout.
fn key_code(name: &str) -> Option<u32> {
    let bytes = name.as_bytes();
    if bytes.len() == 1 {
        return match bytes[0] {
            b @ b'a'..=b'z' => Some(0x41 + (b - b'a') as u32),
            b @ b'0'..=b'9' => Some(0x30 + (b - b'0') as u32),
            _ => None,
        };
    }
    if let Some(n) = name.strip_prefix('f').and_then(|n| n.parse::<u32>().ok()) {
        if (1..=12).contains(&n) {
            return Some(0x70 + n - 1);
        }
    }
    match name {
        "space" => Some(0x20),
        "enter" | "return" => Some(0x0D),
        "tab" => Some(0x09),
        "esc" | "escape" => Some(0x1B),
        _ => None,
    }
}

fn key_name(vk: u32) -> Option<String> {
    match vk {
        0x41..=0x5A | 0x30..=0x39 => char::from_u32(vk).map(|c| c.to_ascii_lowercase().to_string()),
        0x70..=0x7B => Some(format!("f{}", vk - 0x70 + 1)),
        0x20 => Some("space".to_string()),
        0x0D => Some("enter".to_string()),
        0x09 => Some("tab".to_string()),
        0x1B => Some("esc".to_string()),
        _ => None,
    }
}

// Set-1 scan codes written by older recorders as "scNN".
fn scan_code(sc: u32) -> Option<ScanKey> {
    const LETTER_ROWS: [(u32, &str); 3] = [(16, "qwertyuiop"), (30, "asdfghjkl"), (44, "zxcvbnm")];
    match sc {
        29 | 285 => return Some(ScanKey::Modifier(MOD_CONTROL)),
        56 | 312 => return Some(ScanKey::Modifier(MOD_ALT)),
        42 | 54 => return Some(ScanKey::Modifier(MOD_SHIFT)),
        91 | 92 => return Some(ScanKey::Modifier(MOD_WIN)),
        2..=10 => return Some(ScanKey::Key(0x31 + sc - 2)),
        11 => return Some(ScanKey::Key(0x30)),
        57 => return Some(ScanKey::Key(0x20)),
        28 => return Some(ScanKey::Key(0x0D)),
        1 => return Some(ScanKey::Key(0x1B)),
        15 => return Some(ScanKey::Key(0x09)),
        59..=68 => return Some(ScanKey::Key(0x70 + sc - 59)),
        87 | 88 => return Some(ScanKey::Key(0x7A + sc - 87)),
        _ => {}
    }
    LETTER_ROWS.iter().find_map(|(start, row)| {
        let idx = sc.checked_sub(*start)? as usize;
        let ch = row.as_bytes().get(idx)?;
        Some(ScanKey::Key(ch.to_ascii_uppercase() as u32))
    })
}

enum ScanKey {
    Modifier(u32),
    Key(u32),
}

impl Hotkey {
    /// Parses strings like `ctrl+alt+t`. The last non-modifier part wins as the main key.
    pub fn parse(s: &str) -> Result<Self, HotkeyError> {
        let parts: Vec<String> = s
            .split('+')
            .map(|p| p.trim().to_lowercase())
            .filter(|p| !p.is_empty())
            .collect();
        if parts.is_empty() {
            return Err(HotkeyError::Empty);
        }

        let mut modifiers = 0;
        let mut vk = 0;
        for part in &parts {
            if let Some(flag) = modifier_flag(part) {
                modifiers |= flag;
            } else if let Some(code) = key_code(part) {
                vk = code;
            } else if let Some(sc) = part.strip_prefix("sc").and_then(|n| n.parse::<u32>().ok()) {
                match scan_code(sc) {
                    Some(ScanKey::Modifier(flag)) => modifiers |= flag,
                    Some(ScanKey::Key(code)) => vk = code,
                    None => log::warn!("Unknown scan code in hotkey: {:?}", part),
                }
            } else {
                log::warn!("Unknown key part in hotkey: {:?}", part);
            }
        }

        if vk == 0 {
            return Err(HotkeyError::NoMainKey(s.to_string()));
        }
        log::debug!("Parsed hotkey {:?} -> modifiers=0x{:04X} vk=0x{:04X}", s, modifiers, vk);
        Ok(Self { modifiers, vk })
    }

    pub fn display(&self) -> String {
        let mut parts = Vec::new();
        for (flag, name) in [(MOD_CONTROL, "ctrl"), (MOD_ALT, "alt"), (MOD_SHIFT, "shift"), (MOD_WIN, "win")] {
            if self.modifiers & flag != 0 {
                parts.push(name.to_string());
            }
        }
        parts.push(key_name(self.vk).unwrap_or_else(|| format!("vk{:02x}", self.vk)));
        parts.join("+")
    }
}

pub type PressHandler = Arc<dyn Fn() + Send + Sync>;

/// What `unregister` can do with a listener thread, given its startup report.
#[derive(Debug, PartialEq, Eq)]
#[cfg_attr(not(windows), allow(dead_code))]
enum Teardown {
    /// The hotkey is registered on this thread; post `WM_QUIT` to it.
    Quit(u32),
    /// The thread already gave up and is exiting.
    Exited,
    /// Still no word from the thread; it has to be left running.
    Detach,
}

/// A listener that timed out during `register` may still report late; wait once more for it.
#[cfg_attr(not(windows), allow(dead_code))]
fn teardown(
    thread_id: Option<u32>,
    ready: &mpsc::Receiver<Result<u32, HotkeyError>>,
    wait: Duration,
) -> Teardown {
    if let Some(tid) = thread_id {
        return Teardown::Quit(tid);
    }
    match ready.recv_timeout(wait) {
        Ok(Ok(tid)) => Teardown::Quit(tid),
        Ok(Err(_)) | Err(mpsc::RecvTimeoutError::Disconnected) => Teardown::Exited,
        Err(mpsc::RecvTimeoutError::Timeout) => Teardown::Detach,
    }
}

#[cfg(windows)]
mod win {
    use std::sync::mpsc;
    use std::sync::Mutex;
    use std::thread::{self, JoinHandle};
    use std::time::Duration;

    use windows::Win32::Foundation::{HWND, LPARAM, WPARAM};
    use windows::Win32::System::Threading::GetCurrentThreadId;
    use windows::Win32::UI::Input::KeyboardAndMouse as km;
    use windows::Win32::UI::WindowsAndMessaging as wm;

    use super::{teardown, Hotkey, PressHandler, Teardown};
    use crate::error::HotkeyError;

    const HOTKEY_ID: i32 = 1;
    const STARTUP_WAIT: Duration = Duration::from_secs(3);

    struct Listener {
        /// `None` while the thread has not reported its registration yet.
        thread_id: Option<u32>,
        ready: mpsc::Receiver<Result<u32, HotkeyError>>,
        handle: JoinHandle<()>,
    }

    /// Owns the thread that holds the `RegisterHotKey` registration and pumps its messages.
    pub struct HotkeyService {
        on_press: PressHandler,
        listener: Mutex<Option<Listener>>,
    }

    impl HotkeyService {
        pub fn new(on_press: PressHandler) -> Self {
            Self { on_press, listener: Mutex::new(None) }
        }

        pub fn register(&self, hotkey: &Hotkey) -> Result<(), HotkeyError> {
            self.unregister();

            let (tx, rx) = mpsc::channel::<Result<u32, HotkeyError>>();
            let on_press = self.on_press.clone();
            let hotkey = *hotkey;
            let handle = thread::spawn(move || unsafe {
                let tid = GetCurrentThreadId();
                let modifiers = km::HOT_KEY_MODIFIERS(hotkey.modifiers | km::MOD_NOREPEAT.0);
                if km::RegisterHotKey(HWND(std::ptr::null_mut()), HOTKEY_ID, modifiers, hotkey.vk).is_err() {
                    log::error!("RegisterHotKey {} FAILED (tid={})", hotkey.display(), tid);
                    let _ = tx.send(Err(HotkeyError::Register(hotkey.display())));
                    return;
                }
                log::info!("RegisterHotKey {} OK (tid={}); entering message loop", hotkey.display(), tid);
                let _ = tx.send(Ok(tid));

                loop {
                    let mut msg = wm::MSG::default();
                    let got = wm::GetMessageW(&mut msg, HWND(std::ptr::null_mut()), 0, 0);
                    // 0 is WM_QUIT, -1 an error
                    if got.0 <= 0 {
                        log::info!("Hotkey message loop exiting (GetMessageW returned {})", got.0);
                        break;
                    }
                    if msg.message == wm::WM_HOTKEY && msg.wParam.0 == HOTKEY_ID as usize {
                        log::debug!("WM_HOTKEY received ({})", hotkey.display());
                        on_press();
                    }
                }
                let _ = km::UnregisterHotKey(HWND(std::ptr::null_mut()), HOTKEY_ID);
                log::info!("UnregisterHotKey {}", hotkey.display());
            });

            let (thread_id, result) = match rx.recv_timeout(STARTUP_WAIT) {
                Ok(Ok(tid)) => (Some(tid), Ok(())),
                Ok(Err(e)) => {
                    let _ = handle.join();
                    return Err(e);
                }
                Err(_) => {
                    log::warn!("Hotkey thread for {} did not report back in time", hotkey.display());
                    (None, Err(HotkeyError::Timeout))
                }
            };
            // Kept even on timeout so a late registration can still be torn down.
            if let Ok(mut guard) = self.listener.lock() {
                *guard = Some(Listener { thread_id, ready: rx, handle });
            }
            result
        }

        pub fn unregister(&self) {
            let listener = self.listener.lock().ok().and_then(|mut g| g.take());
            let Some(listener) = listener else { return };
            match teardown(listener.thread_id, &listener.ready, STARTUP_WAIT) {
                Teardown::Quit(tid) => {
                    log::debug!("Posting WM_QUIT to hotkey thread (tid={})", tid);
                    unsafe {
                        let _ = wm::PostThreadMessageW(tid, wm::WM_QUIT, WPARAM(0), LPARAM(0));
                    }
                    let _ = listener.handle.join();
                }
                Teardown::Exited => {
                    let _ = listener.handle.join();
                }
                Teardown::Detach => log::warn!("Hotkey thread never reported back; leaving it detached"),
            }
        }
    }
}

#[cfg(not(windows))]
mod unsupported {
    use super::{Hotkey, PressHandler};
    use crate::error::HotkeyError;

    pub struct HotkeyService {
        #[allow(dead_code)]
        on_press: PressHandler,
    }

    impl HotkeyService {
        pub fn new(on_press: PressHandler) -> Self {
            Self { on_press }
        }

        pub fn register(&self, _hotkey: &Hotkey) -> Result<(), HotkeyError> {
            Err(HotkeyError::Unsupported)
        }

        pub fn unregister(&self) {}
    }
}

#[cfg(windows)]
pub use win::HotkeyService;
#[cfg(not(windows))]
pub use unsupported::HotkeyService;
