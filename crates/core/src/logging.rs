//! Log level mapping and sink initialization.
//!
//! Components log through the `log` facade; the binary calls
//! [`init`] exactly once. Levels follow the export server's 0..=4
//! convention rather than the facade's five names.

use std::fs::OpenOptions;
use std::io::Write as _;

use env_logger::{Builder, Target};
use log::LevelFilter;

use crate::config::LoggingConfig;
use crate::error::{ExportError, ExportResult};

/// The five configured log levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    Silent = 0,
    Error = 1,
    Warning = 2,
    Notice = 3,
    Verbose = 4,
}

impl LogLevel {
    /// Clamping conversion from the configured numeric level.
    #[must_use]
    pub const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Silent,
            1 => Self::Error,
            2 => Self::Warning,
            3 => Self::Notice,
            _ => Self::Verbose,
        }
    }

    /// Map onto the `log` facade filter.
    #[must_use]
    pub const fn level_filter(self) -> LevelFilter {
        match self {
            Self::Silent => LevelFilter::Off,
            Self::Error => LevelFilter::Error,
            Self::Warning => LevelFilter::Warn,
            Self::Notice => LevelFilter::Info,
            Self::Verbose => LevelFilter::Debug,
        }
    }
}

/// Initialize the process-wide logger from configuration.
///
/// With `to_file` set, output goes to an append-mode file under
/// `dest`; otherwise it goes to the console. Must only be called once.
pub fn init(config: &LoggingConfig) -> ExportResult<()> {
    let filter = LogLevel::from_u8(config.level).level_filter();
    let mut builder = Builder::new();
    builder.filter_level(filter);
    builder.format(|sink, record| {
        writeln!(
            sink,
            "{} [{}] {}",
            record.level().as_str().to_ascii_lowercase(),
            record.target(),
            record.args()
        )
    });

    if config.to_file {
        std::fs::create_dir_all(&config.dest).map_err(|err| {
            ExportError::ConfigInvalid(format!(
                "cannot create log directory {}: {err}",
                config.dest.display()
            ))
        })?;
        let path = config.dest.join(&config.file);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|err| {
                ExportError::ConfigInvalid(format!(
                    "cannot open log file {}: {err}",
                    path.display()
                ))
            })?;
        builder.target(Target::Pipe(Box::new(file)));
    }

    // A second init (tests, embedding) is not an error worth failing over.
    let _already_set = builder.try_init();
    Ok(())
}
