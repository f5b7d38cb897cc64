use std::any::Any;
use std::cell::Cell;
use std::os::fd::OwnedFd;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use log::{debug, error, trace};
use nix::errno::Errno;
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};

use crate::error::{GpioError, Result};
use crate::sysfs::{Sysfs, SysfsBackend};

use super::disarm;
use super::registry::Registry;
use super::watcher::Watcher;

const REACTOR_EVENT_CAPACITY: usize = 16;

static NEXT_DISPATCHER: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    /// `(dispatcher, lane)` served by the current thread, if it is a worker.
    static CURRENT_LANE: Cell<Option<(usize, usize)>> = const { Cell::new(None) };
}

pub(crate) fn watch_flags() -> EpollFlags {
    EpollFlags::EPOLLIN | EpollFlags::EPOLLET | EpollFlags::EPOLLPRI
}

/// Epoll timeout covering `duration`, rounded up to whole milliseconds.
pub(crate) fn epoll_timeout(duration: Duration) -> EpollTimeout {
    let millis = duration.as_nanos().div_ceil(1_000_000);
    EpollTimeout::from(u16::try_from(millis).unwrap_or(u16::MAX))
}

enum Job {
    Notify(Arc<Watcher>),
    Fence(oneshot::Sender<()>),
}

/// Fixed pool of callback workers. A pin always lands on the same lane, so
/// its callbacks run one at a time and in order.
pub(crate) struct Dispatcher {
    id: usize,
    lanes: Vec<mpsc::UnboundedSender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl Dispatcher {
    pub(crate) fn new<B: SysfsBackend>(count: usize, sysfs: Arc<Sysfs<B>>) -> Self {
        let id = NEXT_DISPATCHER.fetch_add(1, Ordering::Relaxed);
        let (lanes, workers): (Vec<_>, Vec<_>) = (0..count.max(1))
            .map(|lane| {
                let (tx, rx) = mpsc::unbounded_channel();
                let sysfs = sysfs.clone();
                let handle = std::thread::spawn(move || run_lane((id, lane), rx, sysfs));
                (tx, handle)
            })
            .unzip();
        Self { id, lanes, workers }
    }

    fn lane_of(&self, pin: u32) -> usize {
        pin as usize % self.lanes.len().max(1)
    }

    /// Queues a notification unless one is already queued for the watcher.
    pub(crate) fn dispatch(&self, watcher: Arc<Watcher>) {
        if !watcher.mark_pending() {
            return;
        }
        let pin = watcher.pin();
        if let Some(lane) = self.lanes.get(self.lane_of(pin)) {
            if lane.send(Job::Notify(watcher)).is_err() {
                debug!("dispatch lane for pin {pin} is closed");
            }
        }
    }

    /// Blocks until everything queued for `pin` so far has run. A callback
    /// on the pin's own lane skips this, it would wait on itself; nothing
    /// else of that lane can be running meanwhile.
    pub(crate) fn fence(&self, pin: u32) {
        let index = self.lane_of(pin);
        if CURRENT_LANE.with(Cell::get) == Some((self.id, index)) {
            return;
        }
        let Some(lane) = self.lanes.get(index) else {
            return;
        };
        let (tx, rx) = oneshot::channel();
        if lane.send(Job::Fence(tx)).is_ok() {
            let _ = rx.blocking_recv();
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.lanes.clear();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

fn run_lane<B: SysfsBackend>(
    lane: (usize, usize),
    mut rx: mpsc::UnboundedReceiver<Job>,
    sysfs: Arc<Sysfs<B>>,
) {
    CURRENT_LANE.with(|current| current.set(Some(lane)));
    while let Some(job) = rx.blocking_recv() {
        match job {
            Job::Fence(done) => {
                let _ = done.send(());
            }
            Job::Notify(watcher) => notify(&watcher, &sysfs),
        }
    }
    trace!("dispatch lane {} stopped", lane.1);
}

fn notify<B: SysfsBackend>(watcher: &Watcher, sysfs: &Sysfs<B>) {
    watcher.clear_pending();
    if !watcher.is_live() {
        return;
    }
    let pin = watcher.pin();
    for callback in watcher.callbacks() {
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| callback(pin))) {
            let reason = format!("callback panicked: {}", panic_message(payload.as_ref()));
            error!("edge watcher for pin {pin} stopped, {reason}");
            watcher.fail(reason);
            disarm(sysfs, pin);
            return;
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "unknown panic"
    }
}

/// Single epoll instance shared by every watched pin, serviced by one
/// thread.
pub(crate) struct Reactor {
    epoll: Arc<Epoll>,
    shutdown: Arc<AtomicBool>,
    failure: Arc<Mutex<Option<Errno>>>,
    thread: Option<JoinHandle<()>>,
}

impl Reactor {
    pub(crate) fn spawn<B: SysfsBackend>(
        interval: Duration,
        registry: Arc<Registry>,
        dispatcher: Arc<Dispatcher>,
        sysfs: Arc<Sysfs<B>>,
    ) -> Result<Self> {
        let epoll = Arc::new(Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC)?);
        let shutdown = Arc::new(AtomicBool::new(false));
        let failure = Arc::new(Mutex::new(None));

        let thread = {
            let epoll = epoll.clone();
            let shutdown = shutdown.clone();
            let failure = failure.clone();
            std::thread::spawn(move || {
                let mut events = [EpollEvent::empty(); REACTOR_EVENT_CAPACITY];

                while !shutdown.load(Ordering::Acquire) {
                    let ready = match epoll.wait(&mut events, epoll_timeout(interval)) {
                        Ok(n) => n,
                        Err(Errno::EINTR) => continue,
                        Err(e) => {
                            error!("edge reactor stopped: {e}");
                            *failure.lock() = Some(e);
                            for watcher in registry.all() {
                                watcher.fail(format!("readiness multiplexer failed: {e}"));
                                disarm(&sysfs, watcher.pin());
                            }
                            return;
                        }
                    };

                    for event in &events[..ready] {
                        let Some(watcher) = registry.by_token(event.data()) else {
                            continue;
                        };
                        if watcher.on_readiness() {
                            trace!("edge on pin {}", watcher.pin());
                            dispatcher.dispatch(watcher);
                        }
                    }
                }
            })
        };

        Ok(Self {
            epoll,
            shutdown,
            failure,
            thread: Some(thread),
        })
    }

    /// Fails once the reactor thread has died.
    pub(crate) fn check(&self) -> Result<()> {
        match *self.failure.lock() {
            Some(errno) => Err(GpioError::Multiplexer(errno)),
            None => Ok(()),
        }
    }

    pub(crate) fn watch(&self, fd: &OwnedFd, token: u64) -> Result<()> {
        self.epoll.add(fd, EpollEvent::new(watch_flags(), token))?;
        Ok(())
    }

    pub(crate) fn unwatch(&self, fd: &OwnedFd) -> Result<()> {
        self.epoll.delete(fd)?;
        Ok(())
    }

    pub(crate) fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        self.stop();
    }
}
