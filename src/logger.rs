use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing_subscriber::EnvFilter;

use crate::error::Result;

/// Appends log lines to `app-YYYY-MM-DD.txt` under a log directory, moving
/// to a new file when the local date changes.
pub struct LogManager {
    file: Mutex<Option<(PathBuf, File)>>,
    log_dir: PathBuf,
}

impl LogManager {
    pub fn new(log_dir: impl Into<PathBuf>) -> Result<Self> {
        let log_dir = log_dir.into();
        fs::create_dir_all(&log_dir)?;

        Ok(Self {
            file: Mutex::new(None),
            log_dir,
        })
    }

    /// Path of the file today's lines go to.
    pub fn current_log_file(&self) -> PathBuf {
        let now = chrono::Local::now();
        let filename = format!("app-{}.txt", now.format("%Y-%m-%d"));
        self.log_dir.join(filename)
    }

    pub fn write_bytes(&self, buf: &[u8]) -> io::Result<()> {
        let log_path = self.current_log_file();
        let mut file_lock = self
            .file
            .lock()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, format!("Lock error: {}", e)))?;

        // Date rolled over, or the file was removed underneath us
        let needs_new_file = match file_lock.as_ref() {
            Some((path, f)) => *path != log_path || !log_path.exists() || f.metadata().is_err(),
            None => true,
        };

        if needs_new_file {
            let new_file = OpenOptions::new().create(true).append(true).open(&log_path)?;
            *file_lock = Some((log_path, new_file));
        }

        if let Some((_, file)) = file_lock.as_mut() {
            file.write_all(buf)?;
            file.flush()?;
        }
        Ok(())
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }
}

/// Per-event writer handed to the fmt subscriber.
pub struct LogWriter {
    manager: Arc<LogManager>,
}

impl Write for LogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.manager.write_bytes(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Installs the global `tracing` subscriber. `RUST_LOG` wins over
/// `default_filter`. Output goes to the log manager when given, stderr
/// otherwise. Returns false if a subscriber was already installed.
pub fn init_logging(manager: Option<Arc<LogManager>>, default_filter: &str) -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let installed = match manager {
        Some(manager) => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_ansi(false)
            .with_target(true)
            .with_writer(move || LogWriter {
                manager: manager.clone(),
            })
            .try_init(),
        None => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_writer(io::stderr)
            .try_init(),
    };
    installed.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_log_dir() -> PathBuf {
        std::env::temp_dir().join(format!("lettuce-logs-{}", uuid::Uuid::new_v4()))
    }

    #[test]
    fn writes_to_daily_file() {
        let dir = temp_log_dir();
        let manager = Arc::new(LogManager::new(&dir).unwrap());
        let expected = format!("app-{}.txt", chrono::Local::now().format("%Y-%m-%d"));
        assert_eq!(manager.log_dir(), dir.as_path());
        assert_eq!(manager.current_log_file(), dir.join(&expected));

        let mut writer = LogWriter {
            manager: manager.clone(),
        };
        writer.write_all(b"INFO prompt_engine: prompt built\n").unwrap();
        manager.write_bytes(b"second line\n").unwrap();

        let content = fs::read_to_string(dir.join(&expected)).unwrap();
        assert_eq!(content, "INFO prompt_engine: prompt built\nsecond line\n");
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn reopens_removed_file() {
        let dir = temp_log_dir();
        let manager = LogManager::new(&dir).unwrap();
        manager.write_bytes(b"one\n").unwrap();
        let path = manager.current_log_file();
        fs::remove_file(&path).unwrap();
        manager.write_bytes(b"two\n").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "two\n");
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn second_init_reports_false() {
        let dir = temp_log_dir();
        let manager = Arc::new(LogManager::new(&dir).unwrap());
        let first = init_logging(Some(manager), "debug");
        let second = init_logging(None, "info");
        assert!(!second || !first);
        assert!(!init_logging(None, "info"));
        let _ = fs::remove_dir_all(&dir);
    }
}
