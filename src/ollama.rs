//! Model management for the Ollama profile: the chat endpoint is OpenAI compatible,
//! but installing and unloading models goes through Ollama's own `/api` routes.

use reqwest::Url;
use serde::Deserialize;
use serde_json::json;
use std::collections::BTreeSet;
use std::time::Duration;

use crate::api::{idle_bounded, next_chunk, LineBuffer, CLIENT};
use crate::error::TranslateError;

/// `http://localhost:11434/v1` -> `http://localhost:11434`
pub fn ollama_root(base_url: &str) -> Result<String, TranslateError> {
    let url = Url::parse(base_url).map_err(|_| TranslateError::InvalidBaseUrl(base_url.to_string()))?;
    if !url.has_host() {
        return Err(TranslateError::InvalidBaseUrl(base_url.to_string()));
    }
    Ok(url.origin().ascii_serialization())
}

#[derive(Deserialize, Default)]
struct ModelList {
    #[serde(default)]
    models: Vec<ModelEntry>,
}

#[derive(Deserialize)]
struct ModelEntry {
    name: Option<String>,
    model: Option<String>,
}

#[derive(Deserialize)]
struct PullEvent {
    status: Option<String>,
    completed: Option<f64>,
    total: Option<f64>,
    error: Option<String>,
}

async fn check(resp: reqwest::Response) -> Result<reqwest::Response, TranslateError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(TranslateError::Api { status: status.as_u16(), body })
}

pub async fn list_models(base_url: &str) -> Result<BTreeSet<String>, TranslateError> {
    let url = format!("{}/api/tags", ollama_root(base_url)?);
    let resp = CLIENT.get(&url).timeout(Duration::from_secs(15)).send().await?;
    let list: ModelList = check(resp).await?.json().await?;
    Ok(list
        .models
        .into_iter()
        .filter_map(|m| m.name)
        .filter(|n| !n.is_empty())
        .collect())
}

pub async fn list_running_models(base_url: &str) -> Result<Vec<String>, TranslateError> {
    let url = format!("{}/api/ps", ollama_root(base_url)?);
    let resp = CLIENT.get(&url).timeout(Duration::from_secs(10)).send().await?;
    let list: ModelList = check(resp).await?.json().await?;
    Ok(list
        .models
        .into_iter()
        .filter_map(|m| m.model)
        .filter(|n| !n.is_empty())
        .collect())
}

pub fn pull_percent(completed: Option<f64>, total: Option<f64>) -> Option<u8> {
    match (completed, total) {
        (Some(done), Some(total)) if total > 0.0 => Some((done / total * 100.0).clamp(0.0, 100.0) as u8),
        _ => None,
    }
}

/// Longest pause between progress lines before a pull is given up.
pub const PULL_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Streams `/api/pull` progress into `on_progress(status, percent)`.
pub async fn pull_model<F>(base_url: &str, model: &str, on_progress: F) -> Result<(), TranslateError>
where
    F: FnMut(&str, Option<u8>),
{
    pull_model_with_idle(base_url, model, PULL_IDLE_TIMEOUT, on_progress).await
}

pub(crate) async fn pull_model_with_idle<F>(
    base_url: &str,
    model: &str,
    idle: Duration,
    mut on_progress: F,
) -> Result<(), TranslateError>
where
    F: FnMut(&str, Option<u8>),
{
    let url = format!("{}/api/pull", ollama_root(base_url)?);
    log::info!("Pulling model {} via {}", model, url);
    let request = CLIENT.post(&url).json(&json!({ "name": model, "stream": true })).send();
    let resp = idle_bounded(idle, request).await?;
    let resp = idle_bounded(idle, check(resp)).await?;

    let mut handle = |line: &str| -> Result<(), TranslateError> {
        if line.trim().is_empty() {
            return Ok(());
        }
        let Ok(evt) = serde_json::from_str::<PullEvent>(line) else {
            return Ok(());
        };
        if let Some(error) = evt.error {
            return Err(TranslateError::Api { status: 200, body: error });
        }
        let status = evt.status.unwrap_or_else(|| "Downloading".to_string());
        on_progress(&status, pull_percent(evt.completed, evt.total));
        Ok(())
    };

    let mut stream = resp.bytes_stream();
    let mut lines = LineBuffer::default();
    while let Some(chunk) = next_chunk(&mut stream, idle).await? {
        for line in lines.push(&chunk) {
            handle(&line)?;
        }
    }
    if let Some(line) = lines.finish() {
        handle(&line)?;
    }
    log::info!("Pull of {} finished", model);
    Ok(())
}

/// Installs `model` unless the server already has it.
pub async fn ensure_model<F>(base_url: &str, model: &str, on_progress: F) -> Result<bool, TranslateError>
where
    F: FnMut(&str, Option<u8>),
{
    if list_models(base_url).await?.contains(model) {
        return Ok(false);
    }
    pull_model(base_url, model, on_progress).await?;
    Ok(true)
}

pub async fn unload_model(base_url: &str, model: &str) -> Result<(), TranslateError> {
    let url = format!("{}/api/generate", ollama_root(base_url)?);
    let resp = CLIENT
        .post(&url)
        .json(&json!({ "model": model, "keep_alive": 0 }))
        .timeout(Duration::from_secs(15))
        .send()
        .await?;
    check(resp).await?;
    Ok(())
}

/// Best effort: a model that fails to unload does not stop the others.
pub async fn unload_all_running_models(base_url: &str) -> Result<Vec<String>, TranslateError> {
    let running = list_running_models(base_url).await?;
    for name in &running {
        if let Err(e) = unload_model(base_url, name).await {
            log::warn!("Unloading {} failed: {}", name, e);
        }
    }
    Ok(running)
}
