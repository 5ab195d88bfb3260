use crate::error::TranslateError;

/// Synthetic shortcuts sent to whichever window has focus.
pub trait Keyboard {
    fn copy_selection(&self) -> Result<(), TranslateError>;
    fn paste(&self) -> Result<(), TranslateError>;
}

pub struct SystemKeyboard;

const VK_CONTROL: u16 = 0x11;
const VK_SHIFT: u16 = 0x10;
const VK_MENU: u16 = 0x12;
const VK_LWIN: u16 = 0x5B;
const VK_RWIN: u16 = 0x5C;
const VK_C: u16 = 0x43;
const VK_V: u16 = 0x56;

/// `(virtual key, key up)` pairs for Ctrl+`vk`.
/// The hotkey's modifiers are usually still held down; they would turn Ctrl+C into Ctrl+Alt+C.
pub fn ctrl_chord_sequence(vk: u16) -> Vec<(u16, bool)> {
    let mut seq: Vec<(u16, bool)> = [VK_CONTROL, VK_MENU, VK_SHIFT, VK_LWIN, VK_RWIN]
        .into_iter()
        .map(|m| (m, true))
        .collect();
    seq.extend([(VK_CONTROL, false), (vk, false), (vk, true), (VK_CONTROL, true)]);
    seq
}

#[cfg(windows)]
mod win {
    use std::mem;
    use std::thread;
    use std::time::Duration;

    use windows::Win32::UI::Input::KeyboardAndMouse::{
        SendInput, INPUT, INPUT_0, INPUT_KEYBOARD, KEYBDINPUT, KEYBD_EVENT_FLAGS, KEYEVENTF_EXTENDEDKEY,
        KEYEVENTF_KEYUP, VIRTUAL_KEY,
    };

    use super::{ctrl_chord_sequence, VK_RWIN};
    use crate::error::TranslateError;

    fn key_input(vk: u16, up: bool) -> INPUT {
        let mut flags = if vk == VK_RWIN { KEYEVENTF_EXTENDEDKEY } else { KEYBD_EVENT_FLAGS(0) };
        if up {
            flags |= KEYEVENTF_KEYUP;
        }
        INPUT {
            r#type: INPUT_KEYBOARD,
            Anonymous: INPUT_0 {
                ki: KEYBDINPUT { wVk: VIRTUAL_KEY(vk), wScan: 0, dwFlags: flags, time: 0, dwExtraInfo: 0 },
            },
        }
    }

    fn send(inputs: &[INPUT]) -> Result<(), TranslateError> {
        let sent = unsafe { SendInput(inputs, mem::size_of::<INPUT>() as i32) };
        if (sent as usize) < inputs.len() {
            return Err(TranslateError::Input(format!("SendInput injected {} of {} events", sent, inputs.len())));
        }
        Ok(())
    }

    pub fn ctrl_chord(vk: u16) -> Result<(), TranslateError> {
        let seq = ctrl_chord_sequence(vk);
        let (release, chord) = seq.split_at(seq.len() - 4);
        let release: Vec<INPUT> = release.iter().map(|&(k, up)| key_input(k, up)).collect();
        send(&release)?;
        thread::sleep(Duration::from_millis(50));
        let chord: Vec<INPUT> = chord.iter().map(|&(k, up)| key_input(k, up)).collect();
        send(&chord)
    }
}

impl Keyboard for SystemKeyboard {
    fn copy_selection(&self) -> Result<(), TranslateError> {
        #[cfg(windows)]
        {
            log::debug!("Sending Ctrl+C");
            win::ctrl_chord(VK_C)
        }
        #[cfg(not(windows))]
        {
            log::debug!("Cannot send Ctrl+C (0x{:02X}) here", VK_C);
            Err(TranslateError::Unsupported("keyboard simulation"))
        }
    }

    fn paste(&self) -> Result<(), TranslateError> {
        #[cfg(windows)]
        {
            log::debug!("Sending Ctrl+V");
            win::ctrl_chord(VK_V)
        }
        #[cfg(not(windows))]
        {
            log::debug!("Cannot send Ctrl+V (0x{:02X}) here", VK_V);
            Err(TranslateError::Unsupported("keyboard simulation"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chord_releases_held_modifiers_first() {
        let seq = ctrl_chord_sequence(VK_C);
        assert_eq!(seq.len(), 9);
        assert!(seq[..5].iter().all(|&(_, up)| up));
        assert!(seq[..5].contains(&(VK_MENU, true)));
        assert_eq!(
            &seq[5..],
            &[(VK_CONTROL, false), (VK_C, false), (VK_C, true), (VK_CONTROL, true)]
        );
    }
}
