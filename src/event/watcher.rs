use std::os::fd::OwnedFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use parking_lot::{Mutex, RwLock};

use crate::config::Edge;

pub type Callback = Arc<dyn Fn(u32) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherState {
    /// Edge detection is being configured.
    Starting,
    /// Registered with the multiplexer, waiting for the spurious readiness
    /// the kernel raises right after arming.
    Armed,
    Idle,
    /// An edge happened that nobody has polled yet.
    EventObserved,
    Cancelling,
    Stopped,
}

const STARTING: u8 = 0;
const ARMED: u8 = 1;
const RUNNING: u8 = 2;
const FAILED: u8 = 3;
const CANCELLING: u8 = 4;
const STOPPED: u8 = 5;

pub(crate) struct Watcher {
    pin: u32,
    trigger: Edge,
    token: u64,
    phase: AtomicU8,
    pending: AtomicBool,
    event_detected: Mutex<bool>,
    callbacks: RwLock<Vec<Callback>>,
    failure: Mutex<Option<String>>,
    notifier: Mutex<Option<OwnedFd>>,
}

impl Watcher {
    pub(crate) fn new(pin: u32, trigger: Edge, token: u64, callback: Option<Callback>) -> Self {
        Self {
            pin,
            trigger,
            token,
            phase: AtomicU8::new(STARTING),
            pending: AtomicBool::new(false),
            event_detected: Mutex::new(false),
            callbacks: RwLock::new(callback.into_iter().collect()),
            failure: Mutex::new(None),
            notifier: Mutex::new(None),
        }
    }

    pub(crate) fn pin(&self) -> u32 {
        self.pin
    }

    pub(crate) fn trigger(&self) -> Edge {
        self.trigger
    }

    pub(crate) fn token(&self) -> u64 {
        self.token
    }

    /// Hands over the readiness handle; the watcher keeps it open until
    /// cancelled. Returns `false`, dropping the handle, if cancellation got
    /// here first.
    pub(crate) fn arm(&self, notifier: OwnedFd) -> bool {
        let mut slot = self.notifier.lock();
        let armed = self
            .phase
            .compare_exchange(STARTING, ARMED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if armed {
            *slot = Some(notifier);
        }
        armed
    }

    pub(crate) fn with_notifier<R>(&self, f: impl FnOnce(Option<&OwnedFd>) -> R) -> R {
        f(self.notifier.lock().as_ref())
    }

    pub(crate) fn take_notifier(&self) -> Option<OwnedFd> {
        self.notifier.lock().take()
    }

    /// Called by the reactor for each readiness report. Returns whether the
    /// report is a real edge that callbacks should hear about.
    pub(crate) fn on_readiness(&self) -> bool {
        let swap = self
            .phase
            .compare_exchange(ARMED, RUNNING, Ordering::AcqRel, Ordering::Acquire);
        match swap {
            Ok(_) => false,
            Err(RUNNING) => {
                *self.event_detected.lock() = true;
                true
            }
            Err(_) => false,
        }
    }

    /// Claims the single queued notification slot. Readiness reported while a
    /// notification is still queued folds into that one.
    pub(crate) fn mark_pending(&self) -> bool {
        !self.pending.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn clear_pending(&self) {
        self.pending.store(false, Ordering::Release);
    }

    /// Reads and clears the event flag.
    pub(crate) fn take_event(&self) -> bool {
        std::mem::take(&mut *self.event_detected.lock())
    }

    pub(crate) fn add_callback(&self, callback: Callback) {
        self.callbacks.write().push(callback);
    }

    pub(crate) fn callbacks(&self) -> Vec<Callback> {
        self.callbacks.read().clone()
    }

    pub(crate) fn is_live(&self) -> bool {
        matches!(self.phase.load(Ordering::Acquire), ARMED | RUNNING)
    }

    /// Stops reacting to readiness and keeps the first reason for `unregister`.
    pub(crate) fn fail(&self, reason: String) {
        self.failure.lock().get_or_insert(reason);
        let _ = self
            .phase
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |phase| {
                (phase < FAILED).then_some(FAILED)
            });
    }

    pub(crate) fn take_failure(&self) -> Option<String> {
        self.failure.lock().take()
    }

    pub(crate) fn begin_cancel(&self) {
        self.phase.store(CANCELLING, Ordering::Release);
    }

    pub(crate) fn finish(&self) {
        self.phase.store(STOPPED, Ordering::Release);
    }

    pub(crate) fn state(&self) -> WatcherState {
        match self.phase.load(Ordering::Acquire) {
            STARTING => WatcherState::Starting,
            ARMED => WatcherState::Armed,
            RUNNING | FAILED => {
                if *self.event_detected.lock() {
                    WatcherState::EventObserved
                } else {
                    WatcherState::Idle
                }
            }
            CANCELLING => WatcherState::Cancelling,
            _ => WatcherState::Stopped,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_readiness_is_swallowed() {
        let watcher = Watcher::new(4, Edge::Both, 1, None);
        assert!(!watcher.on_readiness(), "not armed yet");

        watcher.phase.store(ARMED, Ordering::Release);
        assert_eq!(watcher.state(), WatcherState::Armed);
        assert!(!watcher.on_readiness());
        assert_eq!(watcher.state(), WatcherState::Idle);
        assert!(!watcher.take_event());

        assert!(watcher.on_readiness());
        assert_eq!(watcher.state(), WatcherState::EventObserved);
        assert!(watcher.take_event());
        assert!(!watcher.take_event());
    }

    #[test]
    fn failed_watcher_ignores_readiness() {
        let watcher = Watcher::new(4, Edge::Rising, 1, None);
        watcher.phase.store(RUNNING, Ordering::Release);
        watcher.fail("boom".into());
        watcher.fail("second".into());

        assert!(!watcher.on_readiness());
        assert!(!watcher.is_live());
        assert_eq!(watcher.take_failure().as_deref(), Some("boom"));
    }

    fn handle() -> OwnedFd {
        nix::sys::eventfd::EventFd::new().expect("eventfd").into()
    }

    #[test]
    fn arming_after_cancel_is_refused() {
        let watcher = Watcher::new(9, Edge::Both, 1, None);
        watcher.begin_cancel();

        assert!(!watcher.arm(handle()));
        assert!(watcher.take_notifier().is_none());
        assert!(!watcher.is_live());
    }

    #[test]
    fn arming_keeps_the_handle() {
        let watcher = Watcher::new(9, Edge::Both, 1, None);
        assert!(watcher.arm(handle()));
        assert_eq!(watcher.state(), WatcherState::Armed);
        assert!(watcher.take_notifier().is_some());
    }

    #[test]
    fn only_one_notification_is_pending() {
        let watcher = Watcher::new(2, Edge::Both, 1, None);
        assert!(watcher.mark_pending());
        assert!(!watcher.mark_pending());
        assert!(!watcher.mark_pending());

        watcher.clear_pending();
        assert!(watcher.mark_pending());
    }
}
