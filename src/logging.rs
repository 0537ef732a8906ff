use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Local;
use log::{Level, Metadata, Record, SetLoggerError};
use serde::Serialize;
use tokio::sync::broadcast;

/// Records kept for a lagging subscriber before the oldest are dropped.
const LOG_CHANNEL_CAPACITY: usize = 256;

static LOGGER: OnceLock<UiLogger> = OnceLock::new();

#[derive(Debug, Serialize, Clone, PartialEq, Eq)]
pub struct LogMessage {
    pub level: String,
    pub message: String,
    pub timestamp: String,
}

/// `log` backend that writes to stderr and fans every record out to UI subscribers.
pub struct UiLogger {
    sender: broadcast::Sender<LogMessage>,
    level: Level,
    echo: AtomicBool,
}

impl UiLogger {
    pub fn new(level: Level) -> Self {
        let (sender, _) = broadcast::channel(LOG_CHANNEL_CAPACITY);
        Self {
            sender,
            level,
            echo: AtomicBool::new(true),
        }
    }

    /// Installs the process-wide logger. Fails if another logger is already set.
    pub fn init(level: Level) -> Result<&'static UiLogger, SetLoggerError> {
        let logger = LOGGER.get_or_init(|| UiLogger::new(level));
        log::set_logger(logger).map(|()| log::set_max_level(level.to_level_filter()))?;
        Ok(logger)
    }

    /// Turns the stderr copy of each record on or off. Subscribers still get everything.
    pub fn set_echo(&self, echo: bool) {
        self.echo.store(echo, Ordering::Relaxed);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LogMessage> {
        self.sender.subscribe()
    }

    fn emit_log(&self, record: &Record) {
        let log_message = LogMessage {
            level: record.level().to_string(),
            message: record.args().to_string(),
            timestamp: Local::now().to_rfc3339(),
        };

        // no subscribers is fine
        let _ = self.sender.send(log_message);
    }
}

impl log::Log for UiLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            if self.echo.load(Ordering::Relaxed) {
                eprintln!("[{}] {}", record.level(), record.args());
            }
            self.emit_log(record);
        }
    }

    fn flush(&self) {}
}
