// ============================================================================
// File: packages/ovbackup/src/logging.rs
// ----------------------------------------------------------------------------
// Log file setup for the binary
// ============================================================================

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{Local, NaiveDateTime};
use env_logger::{Env, Target};
use log::Level;

pub const DEFAULT_LOG_FILE: &str = "/var/log/ovirt-backup.log";

const TIME_FORMAT: &str = "%Y/%m/%d %H:%M:%S";

/// Where records end up
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogTarget {
    File(PathBuf),
    Stderr,
}

/// One log line: `2024/01/31 02:00:00 INFO:message`
pub fn format_line(at: NaiveDateTime, level: Level, message: &str) -> String {
    format!("{} {level}:{message}", at.format(TIME_FORMAT))
}

/// Install the global logger, appending to `log_file`
///
/// Falls back to stderr when the file cannot be opened. The level comes from
/// `RUST_LOG` and defaults to `info`. Calling this twice keeps the first logger.
pub fn init(log_file: &Path) -> LogTarget {
    let mut builder = env_logger::Builder::from_env(Env::default().default_filter_or("info"));
    builder.format(|buf, record| {
        let line = format_line(
            Local::now().naive_local(),
            record.level(),
            &record.args().to_string(),
        );
        writeln!(buf, "{line}")
    });

    let target = match OpenOptions::new().create(true).append(true).open(log_file) {
        Ok(file) => {
            builder.target(Target::Pipe(Box::new(file)));
            LogTarget::File(log_file.to_path_buf())
        }
        Err(e) => {
            eprintln!(
                "warning: cannot open log file {}: {e}; logging to stderr",
                log_file.display()
            );
            builder.target(Target::Stderr);
            LogTarget::Stderr
        }
    };

    let _ = builder.try_init();
    target
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::*;

    #[test]
    fn line_format() {
        let at = NaiveDate::from_ymd_opt(2024, 1, 31)
            .unwrap()
            .and_hms_opt(2, 0, 5)
            .unwrap();
        assert_eq!(
            format_line(at, Level::Warn, "disk busy"),
            "2024/01/31 02:00:05 WARN:disk busy"
        );
    }
}
