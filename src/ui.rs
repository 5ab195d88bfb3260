use crossbeam_channel::{Receiver, Sender};
use eframe::egui;
use std::fs;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::config::{Settings, PROFILES};
use crate::flow::{submit, Job, RunLock, RunPermit, Submit};
use crate::hotkey::{Hotkey, HotkeyService};
use crate::notify::{self, UiEvent, APP_TITLE};

pub const LANGUAGES: &[&str] = &[
    "English", "Russian", "German", "French", "Spanish", "Italian", "Portuguese", "Polish",
    "Ukrainian", "Turkish", "Chinese", "Japanese", "Korean", "Arabic",
];

const OVERLAY_SIZE: [f32; 2] = [260.0, 64.0];
const OVERLAY_BOTTOM_PADDING: f32 = 80.0;

/// Handles the settings window needs into the rest of the app.
pub struct AppShared {
    pub settings: Arc<Mutex<Settings>>,
    pub hotkeys: Arc<HotkeyService>,
    pub jobs: Sender<Job>,
    pub lock: RunLock,
}

/// Bottom-centre placement for the overlay on a monitor of the given size.
pub fn overlay_position(monitor: egui::Vec2, size: egui::Vec2, bottom_padding: f32) -> egui::Pos2 {
    egui::pos2(
        ((monitor.x - size.x) / 2.0).max(0.0),
        (monitor.y - size.y - bottom_padding).max(0.0),
    )
}

/// `Translating`, then one to three dots, advancing every 250 ms.
pub fn animated_label(base: &str, elapsed: Duration) -> String {
    let dots = (elapsed.as_millis() / 250 % 4) as usize;
    format!("{}{}", base, ".".repeat(dots))
}

/// Turns a pressed key plus modifiers into a hotkey string, if it is one we can register.
pub fn hotkey_from_chord(key: egui::Key, modifiers: egui::Modifiers) -> Option<String> {
    let mut parts = Vec::new();
    if modifiers.ctrl || modifiers.command {
        parts.push("ctrl".to_string());
    }
    if modifiers.alt {
        parts.push("alt".to_string());
    }
    if modifiers.shift {
        parts.push("shift".to_string());
    }
    parts.push(key.name().to_lowercase());
    let hotkey = Hotkey::parse(&parts.join("+")).ok()?;
    Some(hotkey.display())
}

#[derive(Default)]
struct OverlayState {
    run: Option<u64>,
    started: Option<Instant>,
    message: String,
    progress: Option<u8>,
    detail: String,
}

impl OverlayState {
    /// Applies the run-scoped overlay events; other events are left alone.
    fn apply(&mut self, event: UiEvent) {
        match event {
            UiEvent::Busy(Some(run)) => {
                *self = OverlayState {
                    run: Some(run),
                    started: Some(Instant::now()),
                    message: "Translating".to_string(),
                    ..Default::default()
                };
            }
            UiEvent::Busy(None) => *self = OverlayState::default(),
            // Events of a run whose overlay is already gone are stale.
            UiEvent::Status { run, text } if self.run == Some(run) => self.message = text,
            UiEvent::Progress { run, percent } if self.run == Some(run) => self.progress = percent,
            UiEvent::Detail { run, text } if self.run == Some(run) => self.detail = text,
            UiEvent::Status { run, .. } | UiEvent::Progress { run, .. } | UiEvent::Detail { run, .. } => {
                log::debug!("Dropping stale overlay update of run #{}", run);
            }
            UiEvent::ShowSettings | UiEvent::Download { .. } => {}
        }
    }
}

#[derive(Default)]
struct DownloadState {
    in_progress: bool,
    status: String,
    percent: Option<u8>,
}

struct Notice {
    text: String,
    is_error: bool,
}

pub struct SettingsApp {
    shared: AppShared,
    rx: Receiver<UiEvent>,
    draft: Settings,
    visible: bool,
    recording_hotkey: bool,
    notice: Option<Notice>,
    overlay: OverlayState,
    download: DownloadState,
}

impl SettingsApp {
    pub fn new(shared: AppShared, rx: Receiver<UiEvent>) -> Self {
        let draft = shared.settings.lock().map(|s| s.clone()).unwrap_or_default();
        Self {
            shared,
            rx,
            draft,
            visible: false,
            recording_hotkey: false,
            notice: None,
            overlay: OverlayState::default(),
            download: DownloadState::default(),
        }
    }

    fn reload_draft(&mut self) {
        if let Ok(settings) = self.shared.settings.lock() {
            self.draft = settings.clone();
        }
    }

    fn handle_event(&mut self, ctx: &egui::Context, event: UiEvent) {
        match event {
            UiEvent::ShowSettings => {
                self.reload_draft();
                self.notice = None;
                self.visible = true;
                ctx.send_viewport_cmd(egui::ViewportCommand::Visible(true));
                ctx.send_viewport_cmd(egui::ViewportCommand::Focus);
                log::info!("Settings window shown");
            }
            UiEvent::Download { in_progress, status, percent } => {
                self.download = DownloadState { in_progress, status, percent };
            }
            other => self.overlay.apply(other),
        }
    }

    fn hide(&mut self, ctx: &egui::Context) {
        self.visible = false;
        self.recording_hotkey = false;
        ctx.send_viewport_cmd(egui::ViewportCommand::Visible(false));
    }

    fn save(&mut self) {
        let mut draft = self.draft.clone();
        for field in [
            &mut draft.base_url,
            &mut draft.model,
            &mut draft.api_key,
            &mut draft.source_lang,
            &mut draft.target_lang,
            &mut draft.hotkey,
        ] {
            *field = field.trim().to_string();
        }
        if let Err(msg) = draft.validate() {
            self.notice = Some(Notice { text: msg, is_error: true });
            return;
        }
        draft.remember_model();
        if let Err(e) = draft.save() {
            log::error!("Saving settings failed: {}", e);
            self.notice = Some(Notice { text: format!("Could not save settings: {}", e), is_error: true });
            return;
        }
        if let Ok(mut settings) = self.shared.settings.lock() {
            *settings = draft.clone();
        }
        self.draft = draft;

        let registered = Hotkey::parse(&self.draft.hotkey)
            .map_err(|e| e.to_string())
            .and_then(|hk| self.shared.hotkeys.register(&hk).map_err(|e| e.to_string()));
        self.notice = Some(match registered {
            Ok(()) => Notice { text: "Settings saved successfully.".to_string(), is_error: false },
            Err(e) => {
                notify::toast("Translator Error", &e);
                Notice { text: format!("Settings saved, but the hotkey failed: {}", e), is_error: true }
            }
        });
    }

    fn start_job(&mut self, make: impl FnOnce(RunPermit) -> Job) {
        let text = match submit(&self.shared.lock, &self.shared.jobs, make) {
            Submit::Queued => return,
            Submit::Busy => "Another operation is in progress.",
            Submit::WorkerGone => "The background worker has stopped; restart the app.",
        };
        self.notice = Some(Notice { text: text.to_string(), is_error: true });
    }

    fn capture_hotkey(&mut self, ctx: &egui::Context) {
        let chord = ctx.input(|i| {
            i.events.iter().find_map(|event| match event {
                egui::Event::Key { key, pressed: true, modifiers, .. } => Some((*key, *modifiers)),
                _ => None,
            })
        });
        let Some((key, modifiers)) = chord else { return };
        if key == egui::Key::Escape && modifiers.is_none() {
            self.recording_hotkey = false;
            return;
        }
        if let Some(hotkey) = hotkey_from_chord(key, modifiers) {
            log::info!("Recorded hotkey {}", hotkey);
            self.draft.hotkey = hotkey;
            self.recording_hotkey = false;
        }
    }

    fn language_row(ui: &mut egui::Ui, id: &str, value: &mut String) {
        ui.horizontal(|ui| {
            ui.add(egui::TextEdit::singleline(value).desired_width(260.0));
            egui::ComboBox::from_id_source(id)
                .selected_text("")
                .width(24.0)
                .show_ui(ui, |ui| {
                    for lang in LANGUAGES {
                        if ui.selectable_label(value.as_str() == *lang, *lang).clicked() {
                            *value = lang.to_string();
                        }
                    }
                });
        });
    }

    fn settings_form(&mut self, ui: &mut egui::Ui) {
        egui::Grid::new("settings_grid")
            .num_columns(2)
            .spacing([10.0, 8.0])
            .show(ui, |ui| {
                ui.label("Profile:");
                let mut chosen = None;
                egui::ComboBox::from_id_source("profile")
                    .selected_text(self.draft.active_profile.as_str())
                    .width(290.0)
                    .show_ui(ui, |ui| {
                        for profile in PROFILES {
                            if ui.selectable_label(self.draft.active_profile == profile.name, profile.name).clicked() {
                                chosen = Some(profile.name);
                            }
                        }
                    });
                if let Some(name) = chosen {
                    self.draft.switch_profile(name);
                }
                ui.end_row();

                ui.label("Base URL:");
                ui.add(egui::TextEdit::singleline(&mut self.draft.base_url).desired_width(290.0));
                ui.end_row();

                ui.label("Model ID:");
                ui.horizontal(|ui| {
                    ui.add(egui::TextEdit::singleline(&mut self.draft.model).desired_width(260.0));
                    let history = self.draft.models_for_active().to_vec();
                    egui::ComboBox::from_id_source("model_history")
                        .selected_text("")
                        .width(24.0)
                        .show_ui(ui, |ui| {
                            if history.is_empty() {
                                ui.weak("No models used yet");
                            }
                            for model in &history {
                                if ui.selectable_label(self.draft.model == *model, model.as_str()).clicked() {
                                    self.draft.model = model.clone();
                                }
                            }
                        });
                });
                ui.end_row();

                ui.label("API key:");
                ui.add(
                    egui::TextEdit::singleline(&mut self.draft.api_key)
                        .password(true)
                        .hint_text("optional")
                        .desired_width(290.0),
                );
                ui.end_row();

                ui.label("Source language:");
                Self::language_row(ui, "source_lang", &mut self.draft.source_lang);
                ui.end_row();

                ui.label("Target language:");
                Self::language_row(ui, "target_lang", &mut self.draft.target_lang);
                ui.end_row();

                ui.label("Hotkey:");
                ui.horizontal(|ui| {
                    let mut shown = self.draft.hotkey.clone();
                    ui.add_enabled(false, egui::TextEdit::singleline(&mut shown).desired_width(200.0));
                    let label = if self.recording_hotkey { "Press keys..." } else { "Record" };
                    if ui.button(label).clicked() {
                        self.recording_hotkey = !self.recording_hotkey;
                    }
                });
                ui.end_row();

                ui.label("");
                ui.checkbox(&mut self.draft.stream, "Stream the response");
                ui.end_row();

                ui.label("");
                ui.checkbox(&mut self.draft.restore_clipboard, "Restore the clipboard after pasting");
                ui.end_row();
            });
    }

    fn ollama_section(&mut self, ui: &mut egui::Ui) {
        ui.add_space(8.0);
        ui.group(|ui| {
            ui.label(egui::RichText::new("Ollama models").strong());
            ui.horizontal(|ui| {
                let idle = !self.shared.lock.is_busy();
                if ui.add_enabled(idle, egui::Button::new("Download model")).clicked() {
                    let base_url = self.draft.base_url.trim().to_string();
                    let model = self.draft.model.trim().to_string();
                    self.start_job(|permit| Job::Pull { base_url, model, permit });
                }
                if ui.add_enabled(idle, egui::Button::new("Unload models")).clicked() {
                    let base_url = self.draft.base_url.trim().to_string();
                    self.start_job(|permit| Job::Unload { base_url, permit });
                }
            });
            if !self.download.status.is_empty() {
                ui.label(self.download.status.as_str());
            }
            if self.download.in_progress {
                let bar = match self.download.percent {
                    Some(p) => egui::ProgressBar::new(p as f32 / 100.0).show_percentage(),
                    None => egui::ProgressBar::new(0.0).animate(true),
                };
                ui.add(bar);
            }
        });
    }

    fn show_overlay(&self, ctx: &egui::Context) {
        let monitor = ctx
            .input(|i| i.viewport().monitor_size)
            .unwrap_or(egui::vec2(1920.0, 1080.0));
        let size = egui::Vec2::from(OVERLAY_SIZE);
        let elapsed = self.overlay.started.map(|t| t.elapsed()).unwrap_or_default();
        let label = animated_label(&self.overlay.message, elapsed);
        let progress = self.overlay.progress;
        let detail = self.overlay.detail.clone();

        ctx.show_viewport_immediate(
            egui::ViewportId::from_hash_of("translating_overlay"),
            egui::ViewportBuilder::default()
                .with_title("Translating")
                .with_decorations(false)
                .with_always_on_top()
                .with_resizable(false)
                .with_taskbar(false)
                .with_inner_size(size)
                .with_position(overlay_position(monitor, size, OVERLAY_BOTTOM_PADDING)),
            |ctx, _class| {
                egui::CentralPanel::default().show(ctx, |ui| {
                    ui.vertical_centered(|ui| {
                        ui.label(label);
                        if let Some(p) = progress {
                            ui.add(egui::ProgressBar::new(p as f32 / 100.0).desired_width(220.0));
                        }
                        if !detail.is_empty() {
                            ui.small(detail);
                        }
                    });
                });
            },
        );
    }
}

impl eframe::App for SettingsApp {
    fn update(&mut self, ctx: &egui::Context, _frame: &mut eframe::Frame) {
        // Wake up periodically so the channel gets drained even without input.
        ctx.request_repaint_after(Duration::from_millis(120));

        while let Ok(event) = self.rx.try_recv() {
            self.handle_event(ctx, event);
        }

        if ctx.input(|i| i.viewport().close_requested()) {
            ctx.send_viewport_cmd(egui::ViewportCommand::CancelClose);
            self.reload_draft();
            self.hide(ctx);
        }

        if self.recording_hotkey && self.visible {
            self.capture_hotkey(ctx);
        }

        egui::CentralPanel::default().show(ctx, |ui| {
            ui.heading("Settings");
            ui.add_space(8.0);
            self.settings_form(ui);

            if self.draft.is_ollama() {
                self.ollama_section(ui);
            }

            ui.add_space(12.0);
            ui.horizontal(|ui| {
                if ui.button("Save").clicked() {
                    self.save();
                }
                if ui.button("Cancel").clicked() {
                    self.reload_draft();
                    self.notice = None;
                    self.hide(ctx);
                }
            });

            if let Some(notice) = &self.notice {
                ui.add_space(6.0);
                let color = if notice.is_error {
                    egui::Color32::from_rgb(200, 40, 40)
                } else {
                    egui::Color32::from_rgb(30, 140, 60)
                };
                ui.colored_label(color, notice.text.as_str());
            }
        });

        if self.overlay.run.is_some() {
            self.show_overlay(ctx);
        }
    }
}

fn configure_fonts(ctx: &egui::Context) {
    let candidates = [
        r"C:\Windows\Fonts\msyh.ttc",
        r"C:\Windows\Fonts\malgun.ttf",
        r"C:\Windows\Fonts\simsun.ttc",
    ];
    let Some((path, bytes)) = candidates
        .iter()
        .find_map(|path| fs::read(path).ok().map(|b| (*path, b)))
    else {
        log::debug!("No CJK fallback font found");
        return;
    };
    let mut fonts = egui::FontDefinitions::default();
    fonts.font_data.insert("cjk".to_owned(), egui::FontData::from_owned(bytes));
    for family in [egui::FontFamily::Proportional, egui::FontFamily::Monospace] {
        fonts.families.entry(family).or_default().push("cjk".to_owned());
    }
    ctx.set_fonts(fonts);
    log::info!("Loaded fallback font {}", path);
}

/// Runs the settings window on the current (main) thread until the process exits.
pub fn run(shared: AppShared, rx: Receiver<UiEvent>) -> anyhow::Result<()> {
    let native_options = eframe::NativeOptions {
        viewport: egui::ViewportBuilder::default()
            .with_title(format!("{} - Settings", APP_TITLE))
            .with_inner_size([520.0, 480.0])
            .with_resizable(false)
            .with_visible(false),
        ..Default::default()
    };
    let app = SettingsApp::new(shared, rx);

    log::info!("Main UI: starting event loop");
    eframe::run_native(
        APP_TITLE,
        native_options,
        Box::new(|cc| {
            notify::set_ui_context(cc.egui_ctx.clone());
            configure_fonts(&cc.egui_ctx);
            Box::new(app)
        }),
    )
    .map_err(|e| anyhow::anyhow!("UI event loop failed: {}", e))?;
    log::info!("Main UI: event loop exited");
    Ok(())
}
