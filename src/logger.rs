use simplelog::{
    ColorChoice, CombinedLogger, ConfigBuilder, LevelFilter, SharedLogger, TermLogger,
    TerminalMode, WriteLogger,
};
use std::fs::OpenOptions;
use std::path::PathBuf;

pub fn exe_dir() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(|d| d.to_path_buf()))
        .unwrap_or_else(|| PathBuf::from("."))
}

pub fn log_path() -> PathBuf {
    exe_dir().join("log.txt")
}

/// Appends to `log.txt` next to the executable; debug builds also log to the terminal.
pub fn init() {
    let config = ConfigBuilder::new()
        .add_filter_ignore_str("wgpu")
        .add_filter_ignore_str("naga")
        .add_filter_ignore_str("winit")
        .add_filter_ignore_str("eframe")
        .build();

    let mut loggers: Vec<Box<dyn SharedLogger>> = Vec::new();
    if cfg!(debug_assertions) {
        loggers.push(TermLogger::new(
            LevelFilter::Debug,
            config.clone(),
            TerminalMode::Mixed,
            ColorChoice::Auto,
        ));
    }
    if let Ok(file) = OpenOptions::new().create(true).append(true).open(log_path()) {
        loggers.push(WriteLogger::new(LevelFilter::Debug, config, file));
    }

    // A second init (tests, restarts of the UI) keeps the first logger.
    if CombinedLogger::init(loggers).is_ok() {
        log::info!("===== {} {} start =====", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
    }
}
