//! Console logging via `env_logger`, with an optional per-run log file under
//! the user data directory. File logging defaults on for debug builds and is
//! overridable with `FUNKWERK_ENABLE_LOGS`; stale files are pruned on startup
//! per `FUNKWERK_LOG_RETENTION_HOURS`.

use chrono::Local;
use env_logger::Builder;
use log::LevelFilter;
use std::fs::{self, File};
use std::io::{LineWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, Once, OnceLock};
use std::time::{Duration, SystemTime};

const FILE_LOGS_ENV: &str = "FUNKWERK_ENABLE_LOGS";
const RETENTION_ENV: &str = "FUNKWERK_LOG_RETENTION_HOURS";
const DEFAULT_RETENTION: Duration = Duration::from_secs(72 * 3_600);

static INIT: Once = Once::new();
static FILE_SINK: OnceLock<Mutex<LineWriter<File>>> = OnceLock::new();

pub fn get_log_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("funkwerk")
        .join("logs")
}

/// Initialize the global logger. Safe to call more than once; only the
/// first call does anything.
pub fn init_logging() {
    INIT.call_once(|| {
        let log_path = open_file_sink();

        let mut builder = Builder::new();
        if let Ok(spec) = std::env::var("RUST_LOG") {
            builder.parse_filters(&spec);
        } else {
            builder
                .filter_level(LevelFilter::Warn)
                .filter_module("funkwerk", LevelFilter::Debug)
                .filter_module("portable_pty", LevelFilter::Info)
                .filter_module("tungstenite", LevelFilter::Info)
                .filter_module("mdns_sd", LevelFilter::Info);
        }

        builder
            .format(|buf, record| {
                let line = format!(
                    "[{} {:<5} {}] {}",
                    Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
                    record.level(),
                    record.target(),
                    record.args()
                );
                if let Some(sink) = FILE_SINK.get() {
                    if let Ok(mut writer) = sink.lock() {
                        let _ = writeln!(writer, "{line}");
                    }
                }
                writeln!(buf, "{line}")
            })
            .target(env_logger::Target::Stderr);
        if cfg!(test) {
            builder.is_test(true);
        }
        builder.init();

        log::info!(
            "Funkwerk v{} starting (pid {})",
            env!("CARGO_PKG_VERSION"),
            std::process::id()
        );
        match log_path {
            Some(path) => log::info!("Logging to {}", path.display()),
            None => log::info!("File logging disabled"),
        }
    });
}

/// Create this run's log file and park it in the global sink. Any failure
/// along the way degrades to console-only logging.
fn open_file_sink() -> Option<PathBuf> {
    if !env_flag(FILE_LOGS_ENV).unwrap_or(cfg!(debug_assertions)) {
        return None;
    }

    let dir = get_log_dir();
    if let Err(err) = fs::create_dir_all(&dir) {
        eprintln!("funkwerk: cannot create log directory {}: {err}", dir.display());
        return None;
    }
    prune_old_logs(&dir, retention_window());

    let path = dir.join(format!(
        "funkwerk-{}.log",
        Local::now().format("%Y%m%d-%H%M%S")
    ));
    match File::options().create(true).append(true).open(&path) {
        Ok(file) => {
            let _ = FILE_SINK.set(Mutex::new(LineWriter::new(file)));
            Some(path)
        }
        Err(err) => {
            eprintln!("funkwerk: cannot open log file {}: {err}", path.display());
            None
        }
    }
}

fn env_flag(name: &str) -> Option<bool> {
    let value = std::env::var(name).ok()?;
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn retention_window() -> Duration {
    std::env::var(RETENTION_ENV)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .map(|hours| Duration::from_secs(hours.saturating_mul(3_600)))
        .unwrap_or(DEFAULT_RETENTION)
}

/// Delete `.log` files older than the retention window. Anything that cannot
/// be inspected or removed is left alone.
fn prune_old_logs(dir: &Path, retention: Duration) {
    let Some(cutoff) = SystemTime::now().checked_sub(retention) else {
        return;
    };
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_file() || path.extension().map_or(true, |ext| ext != "log") {
            continue;
        }
        let stale = entry
            .metadata()
            .and_then(|meta| meta.modified())
            .map(|modified| modified < cutoff)
            .unwrap_or(false);
        if stale {
            if let Err(err) = fs::remove_file(&path) {
                eprintln!("funkwerk: cannot remove old log {}: {err}", path.display());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use filetime::{set_file_mtime, FileTime};
    use serial_test::serial;

    #[test]
    fn log_dir_lives_under_funkwerk_data_dir() {
        let dir = get_log_dir();
        assert!(dir.to_string_lossy().contains("funkwerk"));
        assert!(dir.ends_with("logs"));
    }

    #[test]
    #[serial]
    fn env_flag_parses_booleans_and_ignores_garbage() {
        let name = "FUNKWERK_TEST_FLAG";
        for (value, expected) in [
            ("1", Some(true)),
            ("Yes", Some(true)),
            (" on ", Some(true)),
            ("0", Some(false)),
            ("FALSE", Some(false)),
            ("maybe", None),
        ] {
            std::env::set_var(name, value);
            assert_eq!(env_flag(name), expected, "value {value:?}");
        }
        std::env::remove_var(name);
        assert_eq!(env_flag(name), None);
    }

    #[test]
    #[serial]
    fn retention_window_falls_back_on_bad_values() {
        std::env::set_var(RETENTION_ENV, "12");
        assert_eq!(retention_window(), Duration::from_secs(12 * 3_600));

        std::env::set_var(RETENTION_ENV, "soon");
        assert_eq!(retention_window(), DEFAULT_RETENTION);

        std::env::remove_var(RETENTION_ENV);
        assert_eq!(retention_window(), DEFAULT_RETENTION);
    }

    #[test]
    fn prune_removes_only_stale_log_files() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path();

        let stale = dir.join("funkwerk-stale.log");
        let fresh = dir.join("funkwerk-fresh.log");
        let other = dir.join("notes.txt");
        fs::write(&stale, "stale").unwrap();
        fs::write(&fresh, "fresh").unwrap();
        fs::write(&other, "keep").unwrap();

        let two_hours_ago = SystemTime::now() - Duration::from_secs(2 * 3_600);
        set_file_mtime(&stale, FileTime::from_system_time(two_hours_ago)).unwrap();
        set_file_mtime(&other, FileTime::from_system_time(two_hours_ago)).unwrap();

        prune_old_logs(dir, Duration::from_secs(3_600));

        assert!(!stale.exists());
        assert!(fresh.exists());
        assert!(other.exists());
    }

    #[test]
    fn prune_tolerates_missing_directories() {
        prune_old_logs(Path::new("/no/such/log/dir"), Duration::from_secs(60));
    }
}
