use crate::config::parse_bool_env;
use std::env;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::EnvFilter;

pub const LOG_LEVEL_ENV: &str = "OCP_LOG_LEVEL";
pub const LOG_STDOUT_ENV: &str = "OCP_LOG_STDOUT";
pub const LOG_DIR_ENV: &str = "OCP_LOG_DIR";

type SharedFile = Arc<Mutex<File>>;

/// Keeps the log file open for the life of the process.
pub struct LogGuard {
    _file: Option<SharedFile>,
}

struct MultiWriter {
    stdout: bool,
    file: Option<SharedFile>,
}

impl Write for MultiWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.stdout {
            let _ = io::stdout().write_all(buf);
        } else {
            let _ = io::stderr().write_all(buf);
        }
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let _ = file.write_all(buf);
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.stdout {
            let _ = io::stdout().flush();
        } else {
            let _ = io::stderr().flush();
        }
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let _ = file.flush();
            }
        }
        Ok(())
    }
}

fn open_log_file(dir: &str) -> io::Result<Option<SharedFile>> {
    if dir.trim().is_empty() {
        return Ok(None);
    }
    let dir = PathBuf::from(dir);
    std::fs::create_dir_all(&dir)?;
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join("ocp.log"))?;
    Ok(Some(Arc::new(Mutex::new(file))))
}

/// Installs the global subscriber. `RUST_LOG` overrides `OCP_LOG_LEVEL`.
pub fn init_logging(default_level: &str) -> Option<LogGuard> {
    let level = env::var(LOG_LEVEL_ENV).unwrap_or_else(|_| default_level.to_string());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let stdout = env::var(LOG_STDOUT_ENV)
        .ok()
        .and_then(|value| parse_bool_env(&value))
        .unwrap_or(false);
    let file = match env::var(LOG_DIR_ENV) {
        Ok(dir) => open_log_file(&dir).unwrap_or_else(|err| {
            eprintln!("log_file_error: {err}");
            None
        }),
        Err(_) => None,
    };
    let writer_file = file.clone();
    let make_writer = BoxMakeWriter::new(move || MultiWriter {
        stdout,
        file: writer_file.clone(),
    });
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(make_writer)
        .with_ansi(false)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        return None;
    }
    Some(LogGuard { _file: file })
}
