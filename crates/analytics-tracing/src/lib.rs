use dotenvy::dotenv;
use std::{
    fs::OpenOptions,
    path::{Path, PathBuf},
    sync::Mutex,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Loads `.env` from the working directory or its parents.
///
/// Call it before parsing arguments so env backed options pick it up.
pub fn load_env() {
    match dotenv() {
        Ok(path) => eprintln!(".env read successfully from {}", path.display()),
        Err(e) => eprintln!("Could not load .env file: {e}"),
    };
}

fn init_env_layer() -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into())
}

pub fn init_tracing_to_stdout() {
    let env_layer = init_env_layer();

    let stdout_layer = tracing_subscriber::fmt::layer().with_ansi(true);

    tracing_subscriber::registry()
        .with(env_layer)
        .with(stdout_layer)
        .init();
}

/// Logs to stdout and appends the same records to `log_file`.
pub fn init_tracing_to_stdout_and_file(log_file: impl AsRef<Path>) {
    let log_file = log_file.as_ref();

    let file_log_layer = {
        if let Some(log_dir) = log_dir(log_file) {
            if let Err(e) = std::fs::create_dir_all(&log_dir) {
                eprintln!("Failed to create log dir: {}", e);
                init_tracing_to_stdout(); // fallback to stdout tracing
                return;
            }
        }
        let file = match OpenOptions::new().create(true).append(true).open(log_file) {
            Ok(f) => f,
            Err(e) => {
                eprintln!("Failed to open log file {}: {}", log_file.display(), e);
                init_tracing_to_stdout(); // fallback to stdout tracing
                return;
            }
        };
        tracing_subscriber::fmt::layer()
            .with_writer(Mutex::new(file))
            .with_ansi(false)
    };

    tracing_subscriber::registry()
        .with(init_env_layer())
        .with(tracing_subscriber::fmt::layer().with_ansi(true))
        .with(file_log_layer)
        .init();
}

fn log_dir(log_file: &Path) -> Option<PathBuf> {
    log_file
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .map(Path::to_path_buf)
}

#[test]
fn test_log_dir() {
    assert_eq!(log_dir(Path::new("joy_caption_batch.log")), None);
    assert_eq!(
        log_dir(Path::new("logs/joy_caption_batch.log")),
        Some(PathBuf::from("logs"))
    );
}
