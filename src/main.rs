#![cfg_attr(not(debug_assertions), windows_subsystem = "windows")]

use crossbeam_channel::{Receiver, Sender};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;

mod api;
mod clipboard;
mod config;
mod error;
mod flow;
mod hotkey;
mod input;
mod logger;
mod notify;
mod ollama;
mod tray;
mod ui;

use clipboard::SystemClipboard;
use config::Settings;
use flow::{
    pull_with_progress, submit, unload_with_progress, Backend, HttpBackend, Job, RunLock, Submit, TranslateFlow,
};
use hotkey::{Hotkey, HotkeyService, PressHandler};
use input::SystemKeyboard;
use notify::{Feedback, UiEvent, UiFeedback, APP_TITLE};

fn fatal(message: &str) -> ! {
    log::error!("Fatal: {}", message);
    notify::show_message_box(APP_TITLE, message);
    std::process::exit(1);
}

fn settings_snapshot(settings: &Mutex<Settings>) -> Settings {
    settings.lock().map(|s| s.clone()).unwrap_or_default()
}

/// Executes jobs one at a time; the permit inside each job is released when it is dropped.
fn spawn_worker(
    jobs: Receiver<Job>,
    backend: HttpBackend,
    settings: Arc<Mutex<Settings>>,
    ui_tx: Sender<UiEvent>,
) {
    thread::spawn(move || {
        let flow = TranslateFlow::new(SystemClipboard, SystemKeyboard, backend);
        let mut run_id = 0u64;
        while let Ok(job) = jobs.recv() {
            run_id += 1;
            let feedback = UiFeedback::new(ui_tx.clone(), run_id);
            match job {
                Job::Translate(_permit) => {
                    log::info!("Hotkey run #{} started", run_id);
                    let outcome = flow.run(&settings_snapshot(&settings), &feedback);
                    log::info!("Hotkey run #{} finished: {:?}", run_id, outcome);
                }
                Job::Pull { base_url, model, permit: _permit } => {
                    feedback.busy(true);
                    let result = pull_with_progress(flow.backend(), &base_url, &model, &feedback);
                    feedback.busy(false);
                    if let Err(e) = result {
                        feedback.download(false, &format!("Download failed: {}", e), None);
                        feedback.error(&e.to_string());
                    }
                }
                Job::Unload { base_url, permit: _permit } => {
                    feedback.busy(true);
                    let result = unload_with_progress(flow.backend(), &base_url, &feedback);
                    feedback.busy(false);
                    if let Err(e) = result {
                        feedback.download(false, &format!("Unload failed: {}", e), None);
                        feedback.error(&e.to_string());
                    }
                }
                Job::UnloadAndQuit { base_url, permit: _permit } => {
                    if let Err(e) = flow.backend().unload_models(&base_url) {
                        log::warn!("Unloading models before exit failed: {}", e);
                    }
                    log::info!("Exiting");
                    std::process::exit(0);
                }
            }
        }
    });
}

fn quit(hotkeys: &HotkeyService, settings: &Mutex<Settings>, lock: &RunLock, jobs: &Sender<Job>) {
    hotkeys.unregister();
    let snapshot = settings_snapshot(settings);
    if snapshot.is_ollama() {
        let base_url = snapshot.base_url;
        match submit(lock, jobs, |permit| Job::UnloadAndQuit { base_url, permit }) {
            Submit::Queued => return,
            Submit::Busy => log::info!("Busy at quit; leaving Ollama models loaded"),
            Submit::WorkerGone => {}
        }
    }
    log::info!("Exiting");
    std::process::exit(0);
}

fn main() {
    logger::init();

    let mut settings = Settings::load();
    settings.apply_env_overrides();
    log::info!("Settings loaded from {}", Settings::path().display());
    let hotkey_text = settings.hotkey.clone();
    let settings = Arc::new(Mutex::new(settings));

    let (ui_tx, ui_rx) = crossbeam_channel::unbounded::<UiEvent>();
    let (job_tx, job_rx) = crossbeam_channel::unbounded::<Job>();
    let (tray_tx, tray_rx) = mpsc::channel::<tray::TrayAction>();
    let lock = RunLock::default();

    let backend = HttpBackend::new().unwrap_or_else(|e| fatal(&format!("Could not start the HTTP runtime: {}", e)));
    spawn_worker(job_rx, backend, Arc::clone(&settings), ui_tx.clone());

    let on_press: PressHandler = {
        let lock = lock.clone();
        let job_tx = job_tx.clone();
        Arc::new(move || {
            if submit(&lock, &job_tx, Job::Translate) == Submit::Busy {
                log::warn!("Hotkey ignored; another operation is in progress");
            }
        })
    };
    let hotkeys = Arc::new(HotkeyService::new(on_press));
    let registered = Hotkey::parse(&hotkey_text)
        .map_err(anyhow::Error::from)
        .and_then(|hk| hotkeys.register(&hk).map_err(anyhow::Error::from));
    if let Err(e) = registered {
        fatal(&format!("Could not register the hotkey '{}': {}", hotkey_text, e));
    }

    if let Err(e) = tray::spawn(tray_tx) {
        fatal(&format!("Could not create the tray icon: {}", e));
    }

    {
        let hotkeys = Arc::clone(&hotkeys);
        let settings = Arc::clone(&settings);
        let lock = lock.clone();
        let job_tx = job_tx.clone();
        let ui_tx = ui_tx.clone();
        thread::spawn(move || {
            while let Ok(action) = tray_rx.recv() {
                match action {
                    tray::TrayAction::OpenSettings => {
                        log::info!("OpenSettings action received");
                        notify::send_ui(&ui_tx, UiEvent::ShowSettings);
                    }
                    tray::TrayAction::Quit => {
                        log::info!("Quit action received");
                        quit(&hotkeys, &settings, &lock, &job_tx);
                    }
                }
            }
        });
    }

    notify::toast(APP_TITLE, &format!("Ready. Select text and press {}.", hotkey_text));

    let shared = ui::AppShared { settings, hotkeys, jobs: job_tx, lock };
    if let Err(e) = ui::run(shared, ui_rx) {
        log::error!("{}", e);
    }
}
