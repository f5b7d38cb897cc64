//! Edge detection on exported pins.
//!
//! Persistent watchers share one epoll instance serviced by a reactor thread;
//! callbacks run on a small pool of dispatch workers, one lane per pin. The
//! kernel flags a value file as ready as soon as it is opened for polling, so
//! the first readiness after arming is never reported. Edge detection is put
//! back to `none` whenever a watcher or a blocking wait ends, however it ends.

mod reactor;
mod registry;
mod watcher;

use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, warn};
use nix::errno::Errno;
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent};

use crate::config::{Config, Edge};
use crate::error::{GpioError, Result};
use crate::sysfs::{Sysfs, SysfsBackend};

use reactor::{Dispatcher, Reactor, epoll_timeout, watch_flags};
use registry::Registry;
use watcher::Watcher;

pub use watcher::{Callback, WatcherState};

pub(crate) fn disarm<B: SysfsBackend>(sysfs: &Sysfs<B>, pin: u32) {
    if let Err(e) = sysfs.set_edge(pin, Edge::None) {
        warn!("failed to disarm edge detection on pin {pin}: {e}");
    }
}

fn check_trigger(trigger: Edge) -> Result<()> {
    if trigger == Edge::None {
        return Err(GpioError::InvalidArgument(
            "edge trigger must be rising, falling or both".into(),
        ));
    }
    Ok(())
}

fn unregistered_while_starting(pin: u32) -> GpioError {
    GpioError::WatcherFailed {
        pin,
        reason: "unregistered while starting".into(),
    }
}

pub struct EdgeEngine<B: SysfsBackend> {
    sysfs: Arc<Sysfs<B>>,
    registry: Arc<Registry>,
    dispatcher: Arc<Dispatcher>,
    reactor: Reactor,
    wait_slice: Duration,
}

impl<B: SysfsBackend> EdgeEngine<B> {
    pub fn new(config: &Config, sysfs: Arc<Sysfs<B>>) -> Result<Self> {
        let registry = Arc::new(Registry::default());
        let dispatcher = Arc::new(Dispatcher::new(config.callback_workers, sysfs.clone()));
        let reactor = Reactor::spawn(
            config.watch_interval(),
            registry.clone(),
            dispatcher.clone(),
            sysfs.clone(),
        )?;

        Ok(Self {
            sysfs,
            registry,
            dispatcher,
            reactor,
            wait_slice: config.watch_interval(),
        })
    }

    /// Starts watching `pin`. Fails with [`GpioError::AlreadyRegistered`]
    /// if the pin is watched or a blocking wait is in progress on it.
    pub fn register(&self, pin: u32, trigger: Edge, callback: Option<Callback>) -> Result<()> {
        check_trigger(trigger)?;
        self.reactor.check()?;

        let watcher = Arc::new(Watcher::new(
            pin,
            trigger,
            self.registry.next_token(pin),
            callback,
        ));
        self.registry.insert(watcher.clone())?;

        if let Err(e) = self.start(&watcher) {
            let owned = self.registry.remove_watcher(&watcher);
            if let Some(fd) = watcher.take_notifier() {
                let _ = self.reactor.unwatch(&fd);
            }
            watcher.finish();
            if owned || !self.registry.contains(pin) {
                disarm(&self.sysfs, pin);
            }
            return Err(e);
        }
        debug!("watching pin {pin} for {} edges", trigger.as_sysfs_str());
        Ok(())
    }

    fn start(&self, watcher: &Watcher) -> Result<()> {
        let pin = watcher.pin();
        self.sysfs.set_edge(pin, watcher.trigger())?;
        let notifier = self.sysfs.open_value_notifier(pin)?;
        // armed before the multiplexer can report the initial readiness
        if !watcher.arm(notifier) {
            return Err(unregistered_while_starting(pin));
        }
        watcher.with_notifier(|fd| match fd {
            Some(fd) => self.reactor.watch(fd, watcher.token()),
            None => Ok(()),
        })?;
        if !watcher.is_live() || !self.registry.holds(watcher) {
            return Err(unregistered_while_starting(pin));
        }
        Ok(())
    }

    pub fn add_callback(&self, pin: u32, callback: Callback) -> Result<()> {
        let watcher = self
            .registry
            .get(pin)
            .ok_or(GpioError::NotRegistered(pin))?;
        watcher.add_callback(callback);
        Ok(())
    }

    /// Whether an edge happened on `pin` since the last poll. Unwatched pins
    /// simply report `false`.
    pub fn poll(&self, pin: u32) -> bool {
        self.registry
            .get(pin)
            .map(|watcher| watcher.take_event())
            .unwrap_or(false)
    }

    pub fn state(&self, pin: u32) -> Option<WatcherState> {
        self.registry.get(pin).map(|watcher| watcher.state())
    }

    pub fn is_watched(&self, pin: u32) -> bool {
        self.registry.contains(pin)
    }

    pub fn watched_pins(&self) -> Vec<u32> {
        self.registry.pins()
    }

    /// Stops watching `pin`; a no-op if nothing watches it. Returns once no
    /// further callback for the pin can start and edge detection is off. A
    /// failure captured while watching is reported here.
    pub fn unregister(&self, pin: u32) -> Result<()> {
        match self.registry.remove(pin) {
            Some(watcher) => self.cancel(&watcher),
            None => Ok(()),
        }
    }

    /// Cancels every watcher, reporting the first failure after all of them
    /// have stopped.
    pub fn unregister_all(&self) -> Result<()> {
        let mut first_error = None;
        for watcher in self.registry.drain() {
            if let Err(e) = self.cancel(&watcher) {
                warn!("{e}");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn cancel(&self, watcher: &Watcher) -> Result<()> {
        let pin = watcher.pin();
        watcher.begin_cancel();
        if let Some(fd) = watcher.take_notifier() {
            if let Err(e) = self.reactor.unwatch(&fd) {
                debug!("pin {pin} was not registered with the reactor: {e}");
            }
        }
        self.dispatcher.fence(pin);
        let disarmed = self.sysfs.set_edge(pin, Edge::None);
        watcher.finish();
        debug!("stopped watching pin {pin}");

        if let Some(reason) = watcher.take_failure() {
            return Err(GpioError::WatcherFailed { pin, reason });
        }
        disarmed
    }

    /// Waits for one edge on `pin` without registering a watcher. Returns
    /// `Some(pin)` on an edge and `None` once `timeout` elapses; `None` as the
    /// timeout waits forever.
    pub fn blocking_wait(
        &self,
        pin: u32,
        trigger: Edge,
        timeout: Option<Duration>,
    ) -> Result<Option<u32>> {
        check_trigger(trigger)?;
        self.registry.reserve(pin)?;
        let _guard = WaitGuard {
            sysfs: &self.sysfs,
            registry: &self.registry,
            pin,
        };

        self.sysfs.set_edge(pin, trigger)?;
        let notifier = self.sysfs.open_value_notifier(pin)?;
        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC)?;
        epoll.add(&notifier, EpollEvent::new(watch_flags(), u64::from(pin)))?;

        let deadline = timeout.map(|t| Instant::now() + t);
        let mut events = [EpollEvent::empty(); 1];
        let mut initial = true;
        loop {
            let slice = match deadline {
                Some(deadline) => {
                    let left = deadline.saturating_duration_since(Instant::now());
                    if left.is_zero() {
                        return Ok(None);
                    }
                    left.min(self.wait_slice)
                }
                None => self.wait_slice,
            };

            match epoll.wait(&mut events, epoll_timeout(slice)) {
                Ok(0) | Err(Errno::EINTR) => continue,
                Ok(_) if initial => initial = false,
                Ok(_) => return Ok(Some(pin)),
                Err(e) => return Err(e.into()),
            }
        }
    }
}

impl<B: SysfsBackend> Drop for EdgeEngine<B> {
    fn drop(&mut self) {
        if let Err(e) = self.unregister_all() {
            warn!("edge watchers did not shut down cleanly: {e}");
        }
        self.reactor.stop();
    }
}

struct WaitGuard<'a, B: SysfsBackend> {
    sysfs: &'a Sysfs<B>,
    registry: &'a Registry,
    pin: u32,
}

impl<B: SysfsBackend> Drop for WaitGuard<'_, B> {
    fn drop(&mut self) {
        disarm(self.sysfs, self.pin);
        self.registry.release(self.pin);
    }
}
