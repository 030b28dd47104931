use log::{Level, LevelFilter, Metadata, Record, SetLoggerError};
use serde::Serialize;
use std::sync::OnceLock;
use chrono::Local;
use tokio::sync::broadcast;

static LOGGER: OnceLock<ForwardingLogger> = OnceLock::new();

const LOG_CHANNEL_CAPACITY: usize = 512;

#[derive(Debug, Serialize, Clone)]
pub struct LogMessage {
    pub level: String,
    pub message: String,
    pub timestamp: String,
}

/// Writes records to stderr and forwards them to whoever subscribed.
pub struct ForwardingLogger {
    sender: broadcast::Sender<LogMessage>,
    level: Level,
}

impl ForwardingLogger {
    pub fn new(level: Level) -> Self {
        let (sender, _) = broadcast::channel(LOG_CHANNEL_CAPACITY);
        Self { sender, level }
    }

    /// Installs the forwarding logger. Only the first call installs anything.
    pub fn init(level: Level) -> Result<(), SetLoggerError> {
        let logger = LOGGER.get_or_init(|| ForwardingLogger::new(level));
        log::set_logger(logger).map(|()| log::set_max_level(level.to_level_filter()))
    }

    /// Subscribes to forwarded records, if the forwarding logger is installed.
    pub fn subscribe() -> Option<broadcast::Receiver<LogMessage>> {
        LOGGER.get().map(|logger| logger.sender.subscribe())
    }

    fn to_message(record: &Record) -> LogMessage {
        LogMessage {
            level: record.level().to_string(),
            message: record.args().to_string(),
            timestamp: Local::now().to_rfc3339(),
        }
    }

    fn emit_log(&self, record: &Record) {
        // Nobody listening is fine; stderr already has it.
        let _ = self.sender.send(Self::to_message(record));
    }
}

impl log::Log for ForwardingLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            eprintln!("[{}] {}", record.level(), record.args());
            self.emit_log(record);
        }
    }

    fn flush(&self) {}
}

/// Sets up logging, falling back to env_logger if the forwarding logger cannot be installed.
pub fn init(level: Level) {
    if let Err(e) = ForwardingLogger::init(level) {
        eprintln!("Failed to initialize forwarding logger: {}", e);
        let filter: LevelFilter = level.to_level_filter();
        let _ = env_logger::Builder::new().filter_level(filter).try_init();
    }
}
