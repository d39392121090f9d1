use crate::config::RuntimeConfig;
use std::{
    env,
    fs::{self, File, OpenOptions},
    io,
    path::{Path, PathBuf},
    sync::Arc,
};
use tracing_subscriber::{
    fmt::writer::{BoxMakeWriter, MakeWriterExt},
    EnvFilter,
};
use url::Url;

const DEFAULT_LEVEL: &str = "info";

/// Keeps the log file open for the life of the process.
pub struct LogFile {
    file: Arc<File>,
    path: PathBuf,
}

impl LogFile {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Installs the global subscriber. The dashboard owns stdout, so log lines go
/// to the per-endpoint file unless `RUNWATCH_LOG_STDOUT` asks for both.
pub fn init_logging(config: &RuntimeConfig) -> Option<LogFile> {
    let log_file = match open_log_file(Path::new(&config.log_dir), &config.endpoint) {
        Ok(log_file) => log_file,
        Err(err) => {
            eprintln!("runwatch: cannot open log file in {}: {err}", config.log_dir);
            None
        }
    };
    let writer = log_writer(log_file.as_ref().map(|log| log.file.clone()), config.log_stdout);
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(log_filter())
        .with_ansi(false)
        .with_writer(writer)
        .finish();
    tracing::subscriber::set_global_default(subscriber).ok()?;
    log_file
}

fn log_filter() -> EnvFilter {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }
    env::var("RUNWATCH_LOG_LEVEL")
        .ok()
        .and_then(|level| EnvFilter::try_new(level.trim()).ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_LEVEL))
}

fn log_writer(file: Option<Arc<File>>, stdout: bool) -> BoxMakeWriter {
    match (file, stdout) {
        (Some(file), true) => BoxMakeWriter::new(file.and(io::stdout)),
        (Some(file), false) => BoxMakeWriter::new(file),
        (None, true) => BoxMakeWriter::new(io::stdout),
        (None, false) => BoxMakeWriter::new(io::sink),
    }
}

/// Opens `runwatch-<host>-<port>.log` under `log_dir` for appending. A blank
/// directory disables file logging.
fn open_log_file(log_dir: &Path, endpoint: &Url) -> io::Result<Option<LogFile>> {
    if log_dir.as_os_str().to_string_lossy().trim().is_empty() {
        return Ok(None);
    }
    fs::create_dir_all(log_dir)?;
    let path = log_dir.join(log_file_name(endpoint));
    let file = OpenOptions::new().create(true).append(true).open(&path)?;
    Ok(Some(LogFile {
        file: Arc::new(file),
        path,
    }))
}

fn log_file_name(endpoint: &Url) -> String {
    let host: String = endpoint
        .host_str()
        .unwrap_or("local")
        .chars()
        .map(|ch| if ch.is_ascii_alphanumeric() || ch == '-' { ch } else { '_' })
        .collect();
    match endpoint.port_or_known_default() {
        Some(port) => format!("runwatch-{host}-{port}.log"),
        None => format!("runwatch-{host}.log"),
    }
}
