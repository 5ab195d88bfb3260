use std::sync::mpsc::Sender;

use crate::notify::APP_TITLE;

#[derive(Clone, Debug, PartialEq)]
pub enum TrayAction {
    Quit,
    OpenSettings,
}

pub const ICON_SIZE: usize = 64;

/// Blue square with a white "T", as RGBA rows.
pub fn icon_rgba(size: usize) -> Vec<u8> {
    let margin = size / 5;
    let bar_h = size / 8;
    let stem_w = size / 6;
    let cx = size / 2;

    let mut rgba = vec![0u8; size * size * 4];
    for y in 0..size {
        for x in 0..size {
            let in_bar = (margin..=size - margin).contains(&x) && (margin..=margin + bar_h).contains(&y);
            let in_stem = (cx - stem_w / 2..=cx + stem_w / 2).contains(&x)
                && (margin + bar_h..=size - margin).contains(&y);
            let (r, g, b) = if in_bar || in_stem { (0xFF, 0xFF, 0xFF) } else { (0x21, 0x96, 0xF3) };
            let i = (y * size + x) * 4;
            rgba[i..i + 4].copy_from_slice(&[r, g, b, 0xFF]);
        }
    }
    rgba
}

#[cfg(windows)]
mod win {
    use std::sync::mpsc::{self, Sender};
    use std::thread;
    use std::time::Duration;

    use crossbeam_channel::Receiver;
    use tray_icon as tri;
    use tray_icon::menu::{Menu, MenuEvent, MenuItem, PredefinedMenuItem};
    use tray_icon::{Icon, TrayIcon, TrayIconBuilder};
    use windows::Win32::Foundation::HWND;
    use windows::Win32::UI::WindowsAndMessaging as wm;

    use super::{icon_rgba, TrayAction, APP_TITLE, ICON_SIZE};

    pub struct TrayHandle {
        #[allow(dead_code)]
        tray: TrayIcon,
        menu_event_rx: Receiver<MenuEvent>,
        tray_event_rx: Receiver<tri::TrayIconEvent>,
        quit_item: MenuItem,
        settings_item: MenuItem,
        action_tx: Sender<TrayAction>,
    }

    impl TrayHandle {
        pub fn new(action_tx: Sender<TrayAction>) -> anyhow::Result<Self> {
            let menu = Menu::new();
            let settings = MenuItem::new("Settings", true, None);
            let quit = MenuItem::new("Quit", true, None);
            let sep = PredefinedMenuItem::separator();
            menu.append_items(&[&settings, &sep, &quit])?;

            let icon = Icon::from_rgba(icon_rgba(ICON_SIZE), ICON_SIZE as u32, ICON_SIZE as u32)?;
            let tray = TrayIconBuilder::new()
                .with_tooltip(APP_TITLE)
                .with_menu(Box::new(menu))
                .with_icon(icon)
                .build()?;

            let menu_event_rx = MenuEvent::receiver().clone();
            let tray_event_rx = tri::TrayIconEvent::receiver().clone();

            Ok(Self { tray, menu_event_rx, tray_event_rx, quit_item: quit, settings_item: settings, action_tx })
        }

        pub fn pump(&self) {
            while let Ok(event) = self.menu_event_rx.try_recv() {
                let id = event.id;
                if id == self.quit_item.id() {
                    log::info!("Tray: Quit clicked");
                    let _ = self.action_tx.send(TrayAction::Quit);
                } else if id == self.settings_item.id() {
                    log::info!("Tray: Settings clicked");
                    let _ = self.action_tx.send(TrayAction::OpenSettings);
                }
            }
            while let Ok(event) = self.tray_event_rx.try_recv() {
                match event.click_type {
                    tri::ClickType::Left | tri::ClickType::Double => {
                        log::info!("Tray: left-click, opening settings");
                        let _ = self.action_tx.send(TrayAction::OpenSettings);
                    }
                    _ => {}
                }
            }
        }
    }

    /// The tray lives on its own thread with its own message pump; startup waits for the result.
    pub fn spawn(action_tx: Sender<TrayAction>) -> anyhow::Result<()> {
        let (ready_tx, ready_rx) = mpsc::channel::<Result<(), String>>();
        thread::spawn(move || match TrayHandle::new(action_tx) {
            Ok(tray) => {
                log::info!("Tray created");
                let _ = ready_tx.send(Ok(()));
                loop {
                    unsafe {
                        let mut msg = wm::MSG::default();
                        while wm::PeekMessageW(&mut msg, HWND(std::ptr::null_mut()), 0, 0, wm::PM_REMOVE).into() {
                            let _ = wm::TranslateMessage(&msg);
                            wm::DispatchMessageW(&msg);
                        }
                    }
                    tray.pump();
                    thread::sleep(Duration::from_millis(25));
                }
            }
            Err(e) => {
                log::error!("Tray failed: {}", e);
                let _ = ready_tx.send(Err(e.to_string()));
            }
        });

        match ready_rx.recv_timeout(Duration::from_secs(5)) {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => anyhow::bail!("tray icon: {}", e),
            Err(_) => anyhow::bail!("tray icon: thread did not start"),
        }
    }
}

#[cfg(windows)]
pub fn spawn(action_tx: Sender<TrayAction>) -> anyhow::Result<()> {
    win::spawn(action_tx)
}

#[cfg(not(windows))]
pub fn spawn(_action_tx: Sender<TrayAction>) -> anyhow::Result<()> {
    anyhow::bail!("the tray icon of {} is only available on Windows", APP_TITLE)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pixel(rgba: &[u8], size: usize, x: usize, y: usize) -> [u8; 4] {
        let i = (y * size + x) * 4;
        [rgba[i], rgba[i + 1], rgba[i + 2], rgba[i + 3]]
    }

    #[test]
    fn icon_is_blue_with_white_t() {
        let rgba = icon_rgba(ICON_SIZE);
        assert_eq!(rgba.len(), ICON_SIZE * ICON_SIZE * 4);

        let white = [0xFF, 0xFF, 0xFF, 0xFF];
        let blue = [0x21, 0x96, 0xF3, 0xFF];
        assert_eq!(pixel(&rgba, ICON_SIZE, 0, 0), blue);
        // top bar
        assert_eq!(pixel(&rgba, ICON_SIZE, 14, 14), white);
        // stem, centre column near the bottom
        assert_eq!(pixel(&rgba, ICON_SIZE, 32, 50), white);
        // beside the stem, under the bar
        assert_eq!(pixel(&rgba, ICON_SIZE, 14, 40), blue);
    }
}
