use std::io;
use std::path::PathBuf;

use nix::errno::Errno;
use thiserror::Error;

use crate::config::Direction;

pub type Result<T> = std::result::Result<T, GpioError>;

#[derive(Debug, Error)]
pub enum GpioError {
    #[error("Already exported: {}", path.display())]
    AlreadyExported { path: PathBuf },
    #[error("Pin {0} is not configured")]
    NotConfigured(u32),
    #[error("Pin {0} is already configured")]
    AlreadyConfigured(u32),
    #[error("Pin {pin} is configured for {direction}")]
    WrongDirection { pin: u32, direction: Direction },
    #[error("Conflicting edge detection already enabled for pin {0}")]
    AlreadyRegistered(u32),
    #[error("No edge detection registered for pin {0}")]
    NotRegistered(u32),
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Readiness multiplexer error: {0}")]
    Multiplexer(#[from] Errno),
    #[error("Kernel rejected PWM write (period {period_ns} ns, duty cycle {duty_ns} ns)")]
    PwmOrderingViolation { period_ns: u64, duty_ns: u64 },
    #[error("Edge watcher for pin {pin} failed: {reason}")]
    WatcherFailed { pin: u32, reason: String },
    #[error("Configuration error: {0}")]
    Config(String),
}

impl GpioError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        GpioError::Io {
            path: path.into(),
            source,
        }
    }

    /// Raw errno carried by an [`GpioError::Io`], if any.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            GpioError::Io { source, .. } => source.raw_os_error(),
            _ => None,
        }
    }
}
