use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::config::{Config, Direction, Edge, Level};
use crate::error::{GpioError, Result};
use crate::event::{Callback, EdgeEngine, WatcherState};
use crate::pwm::PwmChannel;
use crate::sysfs::{Sysfs, SysfsBackend};

/// A pin exported through [`GpioManager::setup`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PinExport {
    pub pin: u32,
    pub direction: Direction,
    pub edge: Edge,
}

/// Everything a caller needs to drive pins: sysfs access, the export
/// registrations and the edge engine. Pass it around instead of relying on
/// process-wide state.
pub struct GpioManager<B: SysfsBackend> {
    config: Arc<Config>,
    sysfs: Arc<Sysfs<B>>,
    exports: Mutex<FxHashMap<u32, PinExport>>,
    events: EdgeEngine<B>,
}

impl<B: SysfsBackend> GpioManager<B> {
    pub fn new(config: Arc<Config>, backend: Arc<B>) -> Result<Self> {
        config.validate()?;
        let sysfs = Arc::new(Sysfs::new(&config, backend));
        let events = EdgeEngine::new(&config, sysfs.clone())?;

        Ok(Self {
            config,
            sysfs,
            exports: Mutex::new(FxHashMap::default()),
            events,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn sysfs(&self) -> &Arc<Sysfs<B>> {
        &self.sysfs
    }

    pub fn events(&self) -> &EdgeEngine<B> {
        &self.events
    }

    fn registration(&self, pin: u32, direction: Option<Direction>) -> Result<PinExport> {
        let export = self
            .exports
            .lock()
            .get(&pin)
            .copied()
            .ok_or(GpioError::NotConfigured(pin))?;
        match direction {
            Some(wanted) if wanted != export.direction => Err(GpioError::WrongDirection {
                pin,
                direction: export.direction,
            }),
            _ => Ok(export),
        }
    }

    fn record_edge(&self, pin: u32, edge: Edge) {
        if let Some(export) = self.exports.lock().get_mut(&pin) {
            export.edge = edge;
        }
    }

    pub fn exports(&self) -> Vec<PinExport> {
        let mut exports: Vec<PinExport> = self.exports.lock().values().copied().collect();
        exports.sort_unstable_by_key(|e| e.pin);
        exports
    }

    pub fn export_of(&self, pin: u32) -> Option<PinExport> {
        self.exports.lock().get(&pin).copied()
    }

    /// Exports `pin` and sets its direction. A pin left exported by someone
    /// else is taken over with a warning.
    pub fn setup(&self, pin: u32, direction: Direction, initial: Option<Level>) -> Result<()> {
        if self.exports.lock().contains_key(&pin) {
            return Err(GpioError::AlreadyConfigured(pin));
        }

        match self.sysfs.export(pin) {
            Err(GpioError::AlreadyExported { .. }) => {
                warn!("pin {pin} is already in use, continuing anyway");
                self.sysfs.unexport(pin)?;
                self.sysfs.export(pin)?;
            }
            other => other?,
        }
        self.sysfs.set_direction(pin, direction)?;

        if direction == Direction::Out {
            if let Some(level) = initial {
                self.sysfs.write_value(pin, level)?;
            }
        }

        self.exports.lock().insert(
            pin,
            PinExport {
                pin,
                direction,
                edge: Edge::None,
            },
        );
        debug!("pin {pin} set up as {direction}");
        Ok(())
    }

    /// Stops any edge detection on `pin` and unexports it.
    pub fn teardown(&self, pin: u32) -> Result<()> {
        self.registration(pin, None)?;
        let stopped = self.events.unregister(pin);
        self.exports.lock().remove(&pin);
        self.sysfs.unexport(pin)?;
        stopped
    }

    /// Stops managing `pin` without unexporting it, so an output keeps
    /// driving the level last written after this manager is gone.
    pub fn detach(&self, pin: u32) -> Result<PinExport> {
        let export = self.registration(pin, None)?;
        let stopped = self.events.unregister(pin);
        self.exports.lock().remove(&pin);
        stopped.map(|()| export)
    }

    /// Tears down every watcher and export, continuing past failures and
    /// reporting the first.
    pub fn cleanup(&self) -> Result<()> {
        let mut first_error = self.events.unregister_all().err();
        let pins: Vec<u32> = self.exports.lock().drain().map(|(pin, _)| pin).collect();
        for pin in pins {
            if let Err(e) = self.sysfs.unexport(pin) {
                warn!("failed to unexport pin {pin}: {e}");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    pub fn read(&self, pin: u32) -> Result<Level> {
        self.registration(pin, None)?;
        self.sysfs.read_value(pin)
    }

    pub fn write(&self, pin: u32, level: Level) -> Result<()> {
        self.registration(pin, Some(Direction::Out))?;
        self.sysfs.write_value(pin, level)
    }

    pub fn set_edge(&self, pin: u32, edge: Edge) -> Result<()> {
        self.registration(pin, None)?;
        if self.events.is_watched(pin) {
            return Err(GpioError::AlreadyRegistered(pin));
        }
        self.sysfs.set_edge(pin, edge)?;
        self.record_edge(pin, edge);
        Ok(())
    }

    pub fn add_event_detect(&self, pin: u32, trigger: Edge) -> Result<()> {
        self.watch(pin, trigger, None)
    }

    pub fn add_event_detect_with_callback<F>(
        &self,
        pin: u32,
        trigger: Edge,
        callback: F,
    ) -> Result<()>
    where
        F: Fn(u32) + Send + Sync + 'static,
    {
        self.watch(pin, trigger, Some(Arc::new(callback)))
    }

    fn watch(&self, pin: u32, trigger: Edge, callback: Option<Callback>) -> Result<()> {
        self.registration(pin, Some(Direction::In))?;
        self.events.register(pin, trigger, callback)?;
        self.record_edge(pin, trigger);
        Ok(())
    }

    pub fn add_event_callback<F>(&self, pin: u32, callback: F) -> Result<()>
    where
        F: Fn(u32) + Send + Sync + 'static,
    {
        self.registration(pin, Some(Direction::In))?;
        self.events.add_callback(pin, Arc::new(callback))
    }

    pub fn remove_event_detect(&self, pin: u32) -> Result<()> {
        self.registration(pin, Some(Direction::In))?;
        let stopped = self.events.unregister(pin);
        self.record_edge(pin, Edge::None);
        stopped
    }

    pub fn event_detected(&self, pin: u32) -> Result<bool> {
        self.registration(pin, Some(Direction::In))?;
        Ok(self.events.poll(pin))
    }

    pub fn watcher_state(&self, pin: u32) -> Option<WatcherState> {
        self.events.state(pin)
    }

    pub fn wait_for_edge(
        &self,
        pin: u32,
        trigger: Edge,
        timeout: Option<Duration>,
    ) -> Result<Option<u32>> {
        self.registration(pin, Some(Direction::In))?;
        self.events.blocking_wait(pin, trigger, timeout)
    }

    pub fn pwm(
        &self,
        chip: u32,
        channel: u32,
        frequency_hz: f64,
        duty_percent: f64,
        inverted: bool,
    ) -> Result<PwmChannel<B>> {
        PwmChannel::open(
            self.sysfs.clone(),
            chip,
            channel,
            frequency_hz,
            duty_percent,
            inverted,
        )
    }
}
