//! Primitive access to the gpio and pwm sysfs classes.
//!
//! Every operation touches exactly one control file, identified by pin or
//! chip/channel number, and runs synchronously on the calling thread. Before
//! touching a path the caller waits (bounded) for it to become writable, since
//! udev fixes up permissions asynchronously after an export.

use std::io;
use std::os::fd::OwnedFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, trace};
use nix::errno::Errno;

use crate::config::{Config, Direction, Edge, Level, Polarity};
use crate::error::{GpioError, Result};

/// Raw attribute file access. Implemented for the real filesystem and for an
/// in-memory emulation used in tests.
pub trait SysfsBackend: Send + Sync + 'static {
    fn read_attr(&self, path: &Path) -> io::Result<String>;
    fn write_attr(&self, path: &Path, value: &str) -> io::Result<()>;
    fn is_writable(&self, path: &Path) -> bool;
    /// Opens a handle that becomes ready when the kernel notifies `path`.
    fn open_notifier(&self, path: &Path) -> io::Result<OwnedFd>;
}

pub struct Sysfs<B: SysfsBackend> {
    backend: Arc<B>,
    root: PathBuf,
    permission_timeout: Duration,
    permission_poll: Duration,
}

impl<B: SysfsBackend> Sysfs<B> {
    pub fn new(config: &Config, backend: Arc<B>) -> Self {
        Self {
            backend,
            root: config.sysfs_root.clone(),
            permission_timeout: config.permission_timeout(),
            permission_poll: config.permission_poll(),
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn gpio_control_path(&self, control: &str) -> PathBuf {
        self.root.join("gpio").join(control)
    }

    pub fn gpio_path(&self, pin: u32, attr: &str) -> PathBuf {
        self.root.join("gpio").join(format!("gpio{pin}")).join(attr)
    }

    pub fn pwm_control_path(&self, chip: u32, control: &str) -> PathBuf {
        self.root
            .join("pwm")
            .join(format!("pwmchip{chip}"))
            .join(control)
    }

    pub fn pwm_path(&self, chip: u32, channel: u32, attr: &str) -> PathBuf {
        self.root
            .join("pwm")
            .join(format!("pwmchip{chip}"))
            .join(format!("pwm{channel}"))
            .join(attr)
    }

    /// Polls for write access until the configured ceiling, then gives up
    /// silently so the following I/O reports the real problem.
    pub fn await_permissions(&self, path: &Path) {
        let start = Instant::now();
        while !self.backend.is_writable(path) {
            if start.elapsed() >= self.permission_timeout {
                debug!(
                    "{} still not writable after {:?}",
                    path.display(),
                    self.permission_timeout
                );
                return;
            }
            thread::sleep(self.permission_poll);
        }
    }

    fn write(&self, path: &Path, value: &str) -> Result<()> {
        self.await_permissions(path);
        trace!("write {} <- {value}", path.display());
        self.backend
            .write_attr(path, value)
            .map_err(|e| GpioError::io(path, e))
    }

    fn read(&self, path: &Path) -> Result<String> {
        self.await_permissions(path);
        let raw = self
            .backend
            .read_attr(path)
            .map_err(|e| GpioError::io(path, e))?;
        trace!("read {} -> {}", path.display(), raw.trim());
        Ok(raw.trim().to_string())
    }

    fn read_u64(&self, path: &Path) -> Result<u64> {
        let raw = self.read(path)?;
        raw.parse().map_err(|_| {
            GpioError::InvalidArgument(format!("{} holds '{raw}', not a number", path.display()))
        })
    }

    fn export_to(&self, path: PathBuf, id: u32) -> Result<()> {
        debug!("export {id} via {}", path.display());
        match self.write(&path, &id.to_string()) {
            Err(e) if e.raw_os_error() == Some(Errno::EBUSY as i32) => {
                Err(GpioError::AlreadyExported { path })
            }
            other => other,
        }
    }

    pub fn export(&self, pin: u32) -> Result<()> {
        self.export_to(self.gpio_control_path("export"), pin)
    }

    pub fn unexport(&self, pin: u32) -> Result<()> {
        debug!("unexport gpio {pin}");
        self.write(&self.gpio_control_path("unexport"), &pin.to_string())
    }

    pub fn set_direction(&self, pin: u32, direction: Direction) -> Result<()> {
        self.write(&self.gpio_path(pin, "direction"), direction.as_sysfs_str())
    }

    pub fn read_value(&self, pin: u32) -> Result<Level> {
        let raw = self.read(&self.gpio_path(pin, "value"))?;
        Ok(if raw == "0" { Level::Low } else { Level::High })
    }

    pub fn write_value(&self, pin: u32, level: Level) -> Result<()> {
        self.write(&self.gpio_path(pin, "value"), level.as_sysfs_str())
    }

    pub fn set_edge(&self, pin: u32, edge: Edge) -> Result<()> {
        self.write(&self.gpio_path(pin, "edge"), edge.as_sysfs_str())
    }

    pub fn read_edge(&self, pin: u32) -> Result<Edge> {
        let raw = self.read(&self.gpio_path(pin, "edge"))?;
        Edge::from_sysfs_str(&raw)
            .ok_or_else(|| GpioError::InvalidArgument(format!("unknown edge mode '{raw}'")))
    }

    pub fn open_value_notifier(&self, pin: u32) -> Result<OwnedFd> {
        let path = self.gpio_path(pin, "value");
        self.await_permissions(&path);
        self.backend
            .open_notifier(&path)
            .map_err(|e| GpioError::io(path, e))
    }

    pub fn pwm_export(&self, chip: u32, channel: u32) -> Result<()> {
        self.export_to(self.pwm_control_path(chip, "export"), channel)
    }

    pub fn pwm_unexport(&self, chip: u32, channel: u32) -> Result<()> {
        debug!("unexport pwmchip{chip}/pwm{channel}");
        self.write(
            &self.pwm_control_path(chip, "unexport"),
            &channel.to_string(),
        )
    }

    pub fn pwm_set_enabled(&self, chip: u32, channel: u32, enabled: bool) -> Result<()> {
        let value = if enabled { "1" } else { "0" };
        self.write(&self.pwm_path(chip, channel, "enable"), value)
    }

    pub fn pwm_set_polarity(&self, chip: u32, channel: u32, polarity: Polarity) -> Result<()> {
        self.write(
            &self.pwm_path(chip, channel, "polarity"),
            polarity.as_sysfs_str(),
        )
    }

    pub fn pwm_period(&self, chip: u32, channel: u32) -> Result<u64> {
        self.read_u64(&self.pwm_path(chip, channel, "period"))
    }

    pub fn pwm_duty_cycle(&self, chip: u32, channel: u32) -> Result<u64> {
        self.read_u64(&self.pwm_path(chip, channel, "duty_cycle"))
    }

    /// Writes the period. The kernel refuses a period below the active duty
    /// cycle, reported as [`GpioError::PwmOrderingViolation`].
    pub fn pwm_set_period(&self, chip: u32, channel: u32, period_ns: u64) -> Result<()> {
        let path = self.pwm_path(chip, channel, "period");
        self.write(&path, &period_ns.to_string())
            .map_err(|e| self.ordering_violation(e, chip, channel, Some(period_ns), None))
    }

    pub fn pwm_set_duty_cycle(&self, chip: u32, channel: u32, duty_ns: u64) -> Result<()> {
        let path = self.pwm_path(chip, channel, "duty_cycle");
        self.write(&path, &duty_ns.to_string())
            .map_err(|e| self.ordering_violation(e, chip, channel, None, Some(duty_ns)))
    }

    fn ordering_violation(
        &self,
        err: GpioError,
        chip: u32,
        channel: u32,
        period_ns: Option<u64>,
        duty_ns: Option<u64>,
    ) -> GpioError {
        if err.raw_os_error() != Some(Errno::EINVAL as i32) {
            return err;
        }
        let period_ns = period_ns
            .or_else(|| self.pwm_period(chip, channel).ok())
            .unwrap_or(0);
        let duty_ns = duty_ns
            .or_else(|| self.pwm_duty_cycle(chip, channel).ok())
            .unwrap_or(0);
        GpioError::PwmOrderingViolation { period_ns, duty_ns }
    }
}
