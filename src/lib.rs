mod backend;
mod config;
mod error;
mod event;
mod gpio;
mod pwm;
mod sysfs;

pub use backend::{FsBackend, MockBackend};
pub use config::{Config, Direction, Edge, Level, Polarity};
pub use error::{GpioError, Result};
pub use event::{Callback, EdgeEngine, WatcherState};
pub use gpio::{GpioManager, PinExport};
pub use pwm::{PwmChannel, PwmWrite, plan_frequency_change};
pub use sysfs::{Sysfs, SysfsBackend};
