// src/logging.rs
//
// Timestamped logging shared by the engine threads, the negotiator and the
// TCP fan-out server. Lines go to stderr and, once `init_file_logging` has
// run, are mirrored into a per-run log file.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Global log file handle. When `Some`, `tlog!` writes to both stderr and this file.
#[doc(hidden)]
pub static LOG_FILE: Mutex<Option<std::fs::File>> = Mutex::new(None);

/// Local wall-clock prefix used on every log line.
#[doc(hidden)]
pub fn timestamp() -> String {
    chrono::Local::now().format("%H:%M:%S%.3f").to_string()
}

/// Initialise file logging to the given reports directory.
/// Creates a timestamped log file and a `neurolink.log` symlink (Unix only).
/// Returns the path of the new log file.
pub fn init_file_logging(reports_dir: &Path) -> std::io::Result<PathBuf> {
    std::fs::create_dir_all(reports_dir)?;

    let filename = chrono::Local::now()
        .format("%Y%m%d-%H%M%S-neurolink.log")
        .to_string();
    let log_path = reports_dir.join(&filename);

    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;

    #[cfg(unix)]
    {
        let symlink_path = reports_dir.join("neurolink.log");
        let _ = std::fs::remove_file(&symlink_path);
        if let Err(e) = std::os::unix::fs::symlink(&filename, &symlink_path) {
            eprintln!("{} [logging] Failed to create neurolink.log symlink: {}", timestamp(), e);
        }
    }

    if let Ok(mut guard) = LOG_FILE.lock() {
        *guard = Some(file);
    }

    // tlog! would lock LOG_FILE again, write directly
    eprintln!("{} [logging] File logging started: {}", timestamp(), log_path.display());

    Ok(log_path)
}

/// Stop file logging and close the log file.
pub fn stop_file_logging() {
    if let Ok(mut guard) = LOG_FILE.lock() {
        if guard.is_some() {
            *guard = None;
            eprintln!("{} [logging] File logging stopped", timestamp());
        }
    }
}

/// Timestamped logging macro.
/// Prepends `HH:MM:SS.mmm` local time to every message written to stderr.
/// Also writes to the log file when file logging is enabled.
#[macro_export]
macro_rules! tlog {
    ($($arg:tt)*) => {{
        use std::io::Write as _;
        let msg = format!("{} {}", $crate::logging::timestamp(), format_args!($($arg)*));
        eprintln!("{}", msg);
        if let Ok(mut guard) = $crate::logging::LOG_FILE.lock() {
            if let Some(ref mut f) = *guard {
                let _ = writeln!(f, "{}", msg);
            }
        }
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_logging_writes_lines() {
        let dir = std::env::temp_dir().join(format!("neurolink-log-{}", uuid::Uuid::new_v4().simple()));
        let path = init_file_logging(&dir).expect("init logging");
        tlog!("[test] hello {}", 42);
        stop_file_logging();

        let contents = std::fs::read_to_string(&path).expect("read log");
        assert!(contents.contains("[test] hello 42"));
        let _ = std::fs::remove_dir_all(&dir);
    }
}
