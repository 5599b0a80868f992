use std::{fs, io::Write, path::PathBuf};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

const LOG_FILE_NAME: &str = "certsmith.log";

#[derive(Debug, Clone)]
pub struct LogEntry {
    pub level: LogLevel,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verbosity {
    Quiet,
    Normal,
    Verbose,
    Debug,
}

impl Verbosity {
    fn shows(self, level: LogLevel) -> bool {
        match self {
            Verbosity::Quiet => level == LogLevel::Error,
            Verbosity::Normal => level != LogLevel::Debug,
            Verbosity::Verbose | Verbosity::Debug => true,
        }
    }
}

/// Status sink for a batch run: console output gated by verbosity, plus an
/// append-only log file when one is configured.
pub struct Log {
    verbosity: Verbosity,
    echo: bool,
    progress_to_stderr: bool,
    path: Option<PathBuf>,
    entries: Vec<LogEntry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stream {
    Stdout,
    Stderr,
}

impl Log {
    pub fn new(verbosity: Verbosity, path: Option<PathBuf>) -> Self {
        Self {
            verbosity,
            echo: true,
            progress_to_stderr: false,
            path,
            entries: Vec::new(),
        }
    }

    /// Log file under the app data directory, if it can be resolved.
    pub fn for_cli(verbosity: Verbosity) -> Self {
        let path = crate::config::base_data_dir()
            .ok()
            .filter(|dir| fs::create_dir_all(dir).is_ok())
            .map(|dir| dir.join(LOG_FILE_NAME));
        Self::new(verbosity, path)
    }

    /// Collects entries without printing or writing a file.
    pub fn capture() -> Self {
        Self {
            verbosity: Verbosity::Debug,
            echo: false,
            progress_to_stderr: false,
            path: None,
            entries: Vec::new(),
        }
    }

    /// Keeps stdout free for machine-readable output.
    pub fn progress_to_stderr(mut self) -> Self {
        self.progress_to_stderr = true;
        self
    }

    pub fn debug(&mut self, message: impl Into<String>) {
        self.push(LogLevel::Debug, message.into());
    }

    pub fn info(&mut self, message: impl Into<String>) {
        self.push(LogLevel::Info, message.into());
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        self.push(LogLevel::Warn, message.into());
    }

    pub fn error(&mut self, message: impl Into<String>) {
        self.push(LogLevel::Error, message.into());
    }

    pub fn messages(&self, level: LogLevel) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|entry| entry.level == level)
            .map(|entry| entry.message.as_str())
            .collect()
    }

    pub fn count(&self, level: LogLevel) -> usize {
        self.entries.iter().filter(|entry| entry.level == level).count()
    }

    fn push(&mut self, level: LogLevel, message: String) {
        if self.echo && self.verbosity.shows(level) {
            let line = match level {
                LogLevel::Error => format!("error: {message}"),
                LogLevel::Warn => format!("warning: {message}"),
                LogLevel::Info | LogLevel::Debug => message.clone(),
            };
            match self.stream_for(level) {
                Stream::Stdout => println!("{line}"),
                Stream::Stderr => eprintln!("{line}"),
            }
        }
        if let Some(path) = &self.path {
            let _ = append_log_file(path, level, &message);
        }
        self.entries.push(LogEntry { level, message });
    }
}

impl Log {
    fn stream_for(&self, level: LogLevel) -> Stream {
        match level {
            LogLevel::Error | LogLevel::Warn => Stream::Stderr,
            LogLevel::Info | LogLevel::Debug if self.progress_to_stderr => Stream::Stderr,
            LogLevel::Info | LogLevel::Debug => Stream::Stdout,
        }
    }
}

fn log_level_label(level: LogLevel) -> &'static str {
    match level {
        LogLevel::Debug => "DEBUG",
        LogLevel::Info => "INFO",
        LogLevel::Warn => "WARN",
        LogLevel::Error => "ERROR",
    }
}

fn append_log_file(path: &PathBuf, level: LogLevel, message: &str) -> std::io::Result<()> {
    let label = log_level_label(level);
    let stamp = OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_default();
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    writeln!(file, "[{label}] {stamp} {message}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quiet_only_shows_errors() {
        assert!(Verbosity::Quiet.shows(LogLevel::Error));
        assert!(!Verbosity::Quiet.shows(LogLevel::Warn));
        assert!(!Verbosity::Normal.shows(LogLevel::Debug));
        assert!(Verbosity::Verbose.shows(LogLevel::Debug));
    }

    #[test]
    fn progress_can_move_off_stdout() {
        let log = Log::new(Verbosity::Normal, None);
        assert_eq!(log.stream_for(LogLevel::Info), Stream::Stdout);
        assert_eq!(log.stream_for(LogLevel::Warn), Stream::Stderr);

        let log = Log::new(Verbosity::Normal, None).progress_to_stderr();
        assert_eq!(log.stream_for(LogLevel::Info), Stream::Stderr);
        assert_eq!(log.stream_for(LogLevel::Debug), Stream::Stderr);
        assert_eq!(log.stream_for(LogLevel::Error), Stream::Stderr);
    }

    #[test]
    fn messages_filter_by_level() {
        let mut log = Log::capture();
        log.info("started");
        log.error("row 3 failed");
        log.error("row 5 failed");
        assert_eq!(log.messages(LogLevel::Error), vec!["row 3 failed", "row 5 failed"]);
        assert_eq!(log.messages(LogLevel::Info), vec!["started"]);
    }

    #[test]
    fn writes_labelled_lines_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.log");
        let mut log = Log::new(Verbosity::Quiet, Some(path.clone()));
        log.info("first");
        log.error("second");
        let raw = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = raw.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("[INFO] "));
        assert!(lines[0].ends_with(" first"));
        assert!(lines[1].starts_with("[ERROR] "));
        assert_eq!(log.count(LogLevel::Error), 1);
    }
}
