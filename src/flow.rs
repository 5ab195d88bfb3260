use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::api::{self, TranslationRequest};
use crate::clipboard::Clipboard;
use crate::config::Settings;
use crate::error::TranslateError;
use crate::input::Keyboard;
use crate::notify::Feedback;
use crate::ollama;

const PARTIAL_THROTTLE: Duration = Duration::from_millis(80);

/// Where translations come from. Model provisioning only matters for Ollama.
pub trait Backend {
    fn translate(
        &self,
        req: &TranslationRequest,
        on_partial: &mut dyn FnMut(&str),
    ) -> Result<String, TranslateError>;

    /// Returns `true` when the model had to be downloaded.
    fn ensure_model(
        &self,
        _base_url: &str,
        _model: &str,
        _on_progress: &mut dyn FnMut(&str, Option<u8>),
    ) -> Result<bool, TranslateError> {
        Ok(false)
    }

    fn pull_model(
        &self,
        _base_url: &str,
        _model: &str,
        _on_progress: &mut dyn FnMut(&str, Option<u8>),
    ) -> Result<(), TranslateError> {
        Ok(())
    }

    fn unload_models(&self, _base_url: &str) -> Result<Vec<String>, TranslateError> {
        Ok(Vec::new())
    }
}

/// The OpenAI-compatible HTTP API, driven from a blocking worker thread.
pub struct HttpBackend {
    rt: tokio::runtime::Runtime,
}

impl HttpBackend {
    pub fn new() -> anyhow::Result<Self> {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()?;
        Ok(Self { rt })
    }
}

impl Backend for HttpBackend {
    fn translate(
        &self,
        req: &TranslationRequest,
        on_partial: &mut dyn FnMut(&str),
    ) -> Result<String, TranslateError> {
        self.rt.block_on(api::translate(req, |s| on_partial(s)))
    }

    fn ensure_model(
        &self,
        base_url: &str,
        model: &str,
        on_progress: &mut dyn FnMut(&str, Option<u8>),
    ) -> Result<bool, TranslateError> {
        self.rt
            .block_on(ollama::ensure_model(base_url, model, |s, p| on_progress(s, p)))
    }

    fn pull_model(
        &self,
        base_url: &str,
        model: &str,
        on_progress: &mut dyn FnMut(&str, Option<u8>),
    ) -> Result<(), TranslateError> {
        self.rt
            .block_on(ollama::pull_model(base_url, model, |s, p| on_progress(s, p)))
    }

    fn unload_models(&self, base_url: &str) -> Result<Vec<String>, TranslateError> {
        self.rt.block_on(ollama::unload_all_running_models(base_url))
    }
}

/// Non-blocking single-flight lock shared by hotkey runs, downloads and unloads.
#[derive(Clone, Default)]
pub struct RunLock(Arc<AtomicBool>);

pub struct RunPermit(Arc<AtomicBool>);

impl RunLock {
    pub fn try_acquire(&self) -> Option<RunPermit> {
        if self.0.swap(true, Ordering::AcqRel) {
            return None;
        }
        Some(RunPermit(Arc::clone(&self.0)))
    }

    pub fn is_busy(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

impl Drop for RunPermit {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FlowTiming {
    pub after_copy: Duration,
    pub before_paste: Duration,
    pub before_restore: Duration,
}

impl Default for FlowTiming {
    fn default() -> Self {
        Self {
            after_copy: Duration::from_millis(250),
            before_paste: Duration::from_millis(50),
            before_restore: Duration::from_millis(500),
        }
    }
}

impl FlowTiming {
    pub fn immediate() -> Self {
        Self { after_copy: Duration::ZERO, before_paste: Duration::ZERO, before_restore: Duration::ZERO }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Pasted(String),
    NothingSelected,
    EmptyTranslation,
    Failed,
}

struct BusyGuard<'a>(&'a dyn Feedback);

impl<'a> BusyGuard<'a> {
    fn start(feedback: &'a dyn Feedback) -> Self {
        feedback.busy(true);
        Self(feedback)
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.busy(false);
    }
}

fn sleep(d: Duration) {
    if !d.is_zero() {
        thread::sleep(d);
    }
}

/// Downloads `model`, mirroring progress to the overlay and the settings window.
pub fn pull_with_progress(
    backend: &dyn Backend,
    base_url: &str,
    model: &str,
    feedback: &dyn Feedback,
) -> Result<(), TranslateError> {
    let start = format!("Downloading model: {}", model);
    feedback.status(&start);
    feedback.progress(None);
    feedback.download(true, &start, None);

    backend.pull_model(base_url, model, &mut |status: &str, percent: Option<u8>| {
        feedback.status(status);
        feedback.progress(percent);
        feedback.download(true, status, percent);
    })?;

    feedback.progress(Some(100));
    feedback.download(false, "Download complete", Some(100));
    Ok(())
}

/// Unloads every running Ollama model; reports through the settings window and the overlay.
pub fn unload_with_progress(
    backend: &dyn Backend,
    base_url: &str,
    feedback: &dyn Feedback,
) -> Result<Vec<String>, TranslateError> {
    let start = "Unloading models from memory...";
    feedback.status(start);
    feedback.progress(None);
    feedback.download(true, start, None);

    let unloaded = backend.unload_models(base_url)?;
    let done = if unloaded.is_empty() { "No running models." } else { "Unloaded models." };
    feedback.status(done);
    feedback.download(false, done, None);
    log::info!("Unloaded {:?}", unloaded);
    Ok(unloaded)
}

/// Work for the single worker thread. Each job holds its `RunPermit` until it is done.
pub enum Job {
    Translate(RunPermit),
    Pull { base_url: String, model: String, permit: RunPermit },
    Unload { base_url: String, permit: RunPermit },
    UnloadAndQuit { base_url: String, permit: RunPermit },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submit {
    Queued,
    /// Another job holds the lock; nothing was sent.
    Busy,
    /// The worker thread is gone; the job was dropped and its permit released.
    WorkerGone,
}

/// Takes the lock and hands a job to the worker, unless something is already in flight.
pub fn submit(
    lock: &RunLock,
    jobs: &crossbeam_channel::Sender<Job>,
    make: impl FnOnce(RunPermit) -> Job,
) -> Submit {
    let Some(permit) = lock.try_acquire() else {
        return Submit::Busy;
    };
    if jobs.send(make(permit)).is_err() {
        log::error!("Worker is gone; job dropped");
        return Submit::WorkerGone;
    }
    Submit::Queued
}

/// Selected text in, translated text pasted back.
pub struct TranslateFlow<C, K, B> {
    clipboard: C,
    keyboard: K,
    backend: B,
    timing: FlowTiming,
}

impl<C: Clipboard, K: Keyboard, B: Backend> TranslateFlow<C, K, B> {
    pub fn new(clipboard: C, keyboard: K, backend: B) -> Self {
        Self { clipboard, keyboard, backend, timing: FlowTiming::default() }
    }

    pub fn with_timing(mut self, timing: FlowTiming) -> Self {
        self.timing = timing;
        self
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Runs once. Every failure ends up as exactly one `Feedback::error`.
    pub fn run(&self, settings: &Settings, feedback: &dyn Feedback) -> Outcome {
        match self.try_run(settings, feedback) {
            Ok(outcome) => outcome,
            Err(e) => {
                log::error!("Translation flow failed: {}", e);
                feedback.error(&e.to_string());
                Outcome::Failed
            }
        }
    }

    fn try_run(&self, settings: &Settings, feedback: &dyn Feedback) -> Result<Outcome, TranslateError> {
        let original = self.clipboard.read().unwrap_or_default();
        log::debug!("Original clipboard: {} chars", original.chars().count());

        self.keyboard.copy_selection()?;
        sleep(self.timing.after_copy);

        let selected = self.clipboard.read().unwrap_or_default();
        if selected.is_empty() || selected == original {
            log::info!("No new text copied; skipping translation");
            return Ok(Outcome::NothingSelected);
        }
        log::info!("Translating {} chars with {} to {}", selected.chars().count(), settings.model, settings.target_lang);

        let req = TranslationRequest::from_settings(&selected, settings);
        let translated = {
            let _busy = BusyGuard::start(feedback);

            if settings.is_ollama() {
                self.ensure_model(&req, feedback)?;
            }

            let mut last_update: Option<Instant> = None;
            let mut on_partial = |text: &str| {
                if last_update.map_or(true, |t| t.elapsed() >= PARTIAL_THROTTLE) {
                    last_update = Some(Instant::now());
                    feedback.partial(text);
                }
            };

            match self.backend.translate(&req, &mut on_partial) {
                Err(e) if settings.is_ollama() && e.is_model_not_found() => {
                    log::warn!("{}; pulling and retrying once", e);
                    pull_with_progress(&self.backend, &req.base_url, &req.model, feedback)?;
                    self.backend.translate(&req, &mut on_partial)?
                }
                other => other?,
            }
        };

        if translated.is_empty() {
            return Ok(Outcome::EmptyTranslation);
        }

        self.clipboard.write(&translated)?;
        sleep(self.timing.before_paste);
        self.keyboard.paste()?;
        log::info!("Translation pasted");

        if settings.restore_clipboard && !original.is_empty() {
            sleep(self.timing.before_restore);
            if let Err(e) = self.clipboard.write(&original) {
                log::warn!("Restoring the clipboard failed: {}", e);
            }
        }
        Ok(Outcome::Pasted(translated))
    }

    fn ensure_model(&self, req: &TranslationRequest, feedback: &dyn Feedback) -> Result<(), TranslateError> {
        let pulled = self.backend.ensure_model(&req.base_url, &req.model, &mut |status: &str, percent: Option<u8>| {
            feedback.status(status);
            feedback.progress(percent);
            feedback.download(true, status, percent);
        })?;
        if pulled {
            feedback.progress(Some(100));
            feedback.download(false, "Download complete", Some(100));
        }
        feedback.status("Translating");
        Ok(())
    }
}

impl<B: Backend> Backend for &B {
    fn translate(&self, req: &TranslationRequest, on_partial: &mut dyn FnMut(&str)) -> Result<String, TranslateError> {
        (**self).translate(req, on_partial)
    }

    fn ensure_model(
        &self,
        base_url: &str,
        model: &str,
        on_progress: &mut dyn FnMut(&str, Option<u8>),
    ) -> Result<bool, TranslateError> {
        (**self).ensure_model(base_url, model, on_progress)
    }

    fn pull_model(
        &self,
        base_url: &str,
        model: &str,
        on_progress: &mut dyn FnMut(&str, Option<u8>),
    ) -> Result<(), TranslateError> {
        (**self).pull_model(base_url, model, on_progress)
    }

    fn unload_models(&self, base_url: &str) -> Result<Vec<String>, TranslateError> {
        (**self).unload_models(base_url)
    }
}
