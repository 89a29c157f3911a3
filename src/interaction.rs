// SPDX-License-Identifier: GPL-2.0
//
// Interaction boost: engages a coarse performance hint on discrete UI
// interaction events and releases it once the display reports idle or the
// requested duration runs out.
//
// One background thread owns the idle wait; acquire() only flips state and
// pokes it. An eventfd doubles as the abort signal so a new interaction (or
// shutdown) can interrupt an in-flight poll immediately.

use std::fs::File;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd};
use std::os::unix::fs::FileExt;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use log::{debug, error, warn};
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::eventfd::{EfdFlags, EventFd};

use crate::config::InteractionConfig;
use crate::hints::HintSink;

const INTERACTION_HINT: &str = "INTERACTION";

fn poll_timeout(ms: u64) -> PollTimeout {
    PollTimeout::from(ms.min(u16::MAX as u64) as u16)
}

/// Source of the display idle signal.
pub trait IdleSource: Send + 'static {
    /// Block until the display reports idle, `abort` becomes readable, or
    /// `timeout` elapses, with an initial bounded wait of `wait` before the
    /// idle state is first consulted.
    fn wait_for_idle(&mut self, abort: BorrowedFd<'_>, wait: Duration, timeout: Duration);
}

/// Idle signal read from a sysfs display idle_state node.
pub struct SysfsIdleSource {
    file: File,
}

impl SysfsIdleSource {
    /// Open the first of the candidate nodes that exists.
    pub fn open(paths: &[String]) -> Option<Self> {
        for path in paths {
            if let Ok(file) = File::open(path) {
                return Some(Self { file });
            }
        }
        error!("Unable to open a display idle_state path");
        None
    }

    fn read_is_idle(&self) -> Option<bool> {
        let mut buf = [0u8; 64];
        match self.file.read_at(&mut buf, 0) {
            Ok(0) => {
                error!("Unexpected EOF reading idle state");
                None
            }
            Ok(_) => Some(buf.starts_with(b"idle")),
            Err(e) => {
                error!("Failed to read idle state: {}", e);
                None
            }
        }
    }
}

impl IdleSource for SysfsIdleSource {
    fn wait_for_idle(&mut self, abort: BorrowedFd<'_>, wait: Duration, timeout: Duration) {
        // Bounded settle wait first; an abort during it wins.
        let mut fds = [PollFd::new(abort, PollFlags::POLLIN)];
        match poll(&mut fds, poll_timeout(wait.as_millis() as u64)) {
            Ok(n) if n > 0 => {
                debug!("idle wait aborted");
                return;
            }
            Err(e) => {
                error!("error in poll while waiting: {}", e);
                return;
            }
            _ => {}
        }

        match self.read_is_idle() {
            Some(true) => {
                debug!("display already idle");
                return;
            }
            None => return,
            Some(false) => {}
        }

        // Sysfs signals an idle transition with POLLPRI on the node.
        let mut fds = [
            PollFd::new(abort, PollFlags::POLLIN),
            PollFd::new(self.file.as_fd(), PollFlags::POLLPRI | PollFlags::POLLERR),
        ];
        match poll(&mut fds, poll_timeout(timeout.as_millis() as u64)) {
            Err(e) => error!("error waiting for idle: {}", e),
            Ok(0) => debug!("timed out waiting for idle"),
            Ok(_) => debug!("idle wait finished"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InteractionState {
    Uninitialized,
    Idle,
    Interacting,
    Waiting,
}

struct StateData {
    state: InteractionState,
    duration_ms: u32,
    last: Instant,
}

struct Inner {
    data: Mutex<StateData>,
    cond: Condvar,
    event_fd: Option<EventFd>,
    hints: Arc<dyn HintSink>,
    config: InteractionConfig,
}

impl Inner {
    fn perf_lock(&self) {
        if !self.hints.do_hint(INTERACTION_HINT, None) {
            error!("do hint {} failed", INTERACTION_HINT);
        }
    }

    fn perf_rel(&self) {
        if !self.hints.end_hint(INTERACTION_HINT) {
            error!("end hint {} failed", INTERACTION_HINT);
        }
    }

    // Caller must hold the state lock.
    fn abort_wait_locked(&self) {
        if let Some(fd) = &self.event_fd {
            if let Err(e) = fd.write(1) {
                warn!("Unable to write to event fd: {}", e);
            }
        }
    }

    fn release(&self) {
        let mut data = self.data.lock().unwrap();
        if data.state == InteractionState::Waiting {
            self.perf_rel();
            data.state = InteractionState::Idle;
        } else if let Some(fd) = &self.event_fd {
            // The wait was aborted; clear the pending token.
            let mut buf = [0u8; 8];
            if let Err(e) = nix::unistd::read(fd.as_fd().as_raw_fd(), &mut buf) {
                warn!("failed to clear event fd: {}", e);
            }
        }
    }

    fn routine<S: IdleSource>(inner: Arc<Inner>, mut source: S) {
        loop {
            let mut data = inner.data.lock().unwrap();
            while data.state == InteractionState::Idle {
                data = inner.cond.wait(data).unwrap();
            }
            if data.state == InteractionState::Uninitialized {
                return;
            }
            data.state = InteractionState::Waiting;
            let duration = Duration::from_millis(data.duration_ms as u64);
            drop(data);

            let abort = match &inner.event_fd {
                Some(fd) => fd,
                None => return,
            };
            source.wait_for_idle(
                abort.as_fd(),
                Duration::from_millis(inner.config.wait_ms as u64),
                duration,
            );
            inner.release();
        }
    }
}

pub struct InteractionHandler {
    inner: Arc<Inner>,
    thread: Option<JoinHandle<()>>,
}

impl InteractionHandler {
    pub fn new(config: InteractionConfig, hints: Arc<dyn HintSink>) -> Self {
        let event_fd = match EventFd::from_value_and_flags(0, EfdFlags::EFD_NONBLOCK) {
            Ok(fd) => Some(fd),
            Err(e) => {
                // Without an abort channel the idle wait cannot run; stay
                // uninitialized and boost unconditionally.
                error!("Unable to create event fd: {}", e);
                None
            }
        };
        Self {
            inner: Arc::new(Inner {
                data: Mutex::new(StateData {
                    state: InteractionState::Uninitialized,
                    duration_ms: 0,
                    last: Instant::now(),
                }),
                cond: Condvar::new(),
                event_fd,
                hints,
                config,
            }),
            thread: None,
        }
    }

    /// Start idle-aware operation using the configured sysfs idle node.
    /// Returns false (leaving the unconditional-boost fallback in place) if
    /// the idle signal is unavailable.
    pub fn init(&mut self) -> bool {
        if !self.inner.config.idle_support {
            return false;
        }
        match SysfsIdleSource::open(&self.inner.config.idle_state_paths) {
            Some(source) => self.init_with_source(source),
            None => false,
        }
    }

    /// Start idle-aware operation with an explicit idle source.
    pub fn init_with_source<S: IdleSource>(&mut self, source: S) -> bool {
        {
            let mut data = self.inner.data.lock().unwrap();
            if data.state != InteractionState::Uninitialized {
                return true;
            }
            if self.inner.event_fd.is_none() {
                return false;
            }
            data.state = InteractionState::Idle;
        }
        let inner = Arc::clone(&self.inner);
        match std::thread::Builder::new()
            .name("disp-idle".into())
            .spawn(move || Inner::routine(inner, source))
        {
            Ok(handle) => {
                self.thread = Some(handle);
                true
            }
            Err(e) => {
                error!("Failed to spawn display idle thread: {}", e);
                self.inner.data.lock().unwrap().state = InteractionState::Uninitialized;
                false
            }
        }
    }

    /// Interaction event: boost for (roughly) `duration_ms`, coalescing
    /// requests already covered by a running boost.
    pub fn acquire(&self, duration_ms: i32) {
        let inner = &self.inner;
        let mut data = inner.data.lock().unwrap();

        let requested = duration_ms.max(0) as u32 + inner.config.duration_offset_ms;
        let final_ms = if requested > inner.config.max_duration_ms {
            inner.config.max_duration_ms
        } else if requested > inner.config.min_duration_ms {
            requested
        } else {
            inner.config.min_duration_ms
        };

        // Without idle detection the hint is simply timed.
        if !inner.config.idle_support || data.state == InteractionState::Uninitialized {
            inner.hints.do_hint(
                INTERACTION_HINT,
                Some(Duration::from_millis(final_ms as u64)),
            );
            return;
        }

        let now = Instant::now();
        if data.state != InteractionState::Idle && final_ms <= data.duration_ms {
            let elapsed = now.duration_since(data.last);
            // The running boost already covers this request.
            if elapsed <= Duration::from_millis((data.duration_ms - final_ms) as u64) {
                debug!(
                    "previous duration ({}ms) covers this ({}ms), elapsed {:?}",
                    data.duration_ms, final_ms, elapsed
                );
                return;
            }
        }
        data.last = now;
        data.duration_ms = final_ms;

        debug!("input: {}ms final duration: {}ms", duration_ms, final_ms);

        match data.state {
            InteractionState::Waiting => inner.abort_wait_locked(),
            InteractionState::Idle => inner.perf_lock(),
            _ => {}
        }
        data.state = InteractionState::Interacting;
        inner.cond.notify_one();
    }

    /// Stop the background thread and drop back to uninitialized.
    pub fn exit(&mut self) {
        {
            let mut data = self.inner.data.lock().unwrap();
            if data.state == InteractionState::Uninitialized {
                return;
            }
            self.inner.abort_wait_locked();
            data.state = InteractionState::Uninitialized;
        }
        self.inner.cond.notify_all();
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                warn!("display idle thread panicked");
            }
        }
    }
}

impl Drop for InteractionHandler {
    fn drop(&mut self) {
        self.exit();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hints::testing::{HintCall, MockHintSink};

    fn test_config() -> InteractionConfig {
        InteractionConfig {
            idle_support: true,
            wait_ms: 5,
            min_duration_ms: 10,
            max_duration_ms: 100,
            duration_offset_ms: 0,
            idle_state_paths: vec![],
        }
    }

    /// Never reports idle: waits out the abort fd until the timeout.
    struct NeverIdle;

    impl IdleSource for NeverIdle {
        fn wait_for_idle(&mut self, abort: BorrowedFd<'_>, wait: Duration, timeout: Duration) {
            let mut fds = [PollFd::new(abort, PollFlags::POLLIN)];
            let total = (wait + timeout).as_millis() as u64;
            let _ = poll(&mut fds, poll_timeout(total));
        }
    }

    /// Reports idle almost immediately unless aborted first.
    struct InstantIdle;

    impl IdleSource for InstantIdle {
        fn wait_for_idle(&mut self, abort: BorrowedFd<'_>, _wait: Duration, _timeout: Duration) {
            let mut fds = [PollFd::new(abort, PollFlags::POLLIN)];
            let _ = poll(&mut fds, poll_timeout(1));
        }
    }

    #[test]
    fn test_uninitialized_falls_back_to_timed_hint() {
        let hints = Arc::new(MockHintSink::default());
        let handler = InteractionHandler::new(test_config(), hints.clone());

        handler.acquire(50);
        assert_eq!(
            hints.calls(),
            vec![HintCall::Do(
                "INTERACTION".into(),
                Some(Duration::from_millis(50))
            )]
        );
    }

    #[test]
    fn test_duration_clamping() {
        let hints = Arc::new(MockHintSink::default());
        let config = InteractionConfig {
            duration_offset_ms: 650,
            min_duration_ms: 1400,
            max_duration_ms: 5650,
            ..test_config()
        };
        let handler = InteractionHandler::new(config, hints.clone());

        handler.acquire(200); // 850 after offset, below the minimum
        handler.acquire(2000); // 2650, within band
        handler.acquire(6000); // 6650, above the maximum
        let calls = hints.calls();
        assert_eq!(
            calls,
            vec![
                HintCall::Do("INTERACTION".into(), Some(Duration::from_millis(1400))),
                HintCall::Do("INTERACTION".into(), Some(Duration::from_millis(2650))),
                HintCall::Do("INTERACTION".into(), Some(Duration::from_millis(5650))),
            ]
        );
    }

    #[test]
    fn test_covered_request_is_coalesced() {
        let hints = Arc::new(MockHintSink::default());
        let mut handler = InteractionHandler::new(test_config(), hints.clone());
        assert!(handler.init_with_source(NeverIdle));

        handler.acquire(100); // engages, duration 100ms
        handler.acquire(10); // remaining 100-10=90ms covers it: no new call
        assert_eq!(hints.engage_count("INTERACTION"), 1);
        assert_eq!(hints.calls().len(), 1);
        handler.exit();
    }

    #[test]
    fn test_expired_request_rearms_without_reengaging() {
        let hints = Arc::new(MockHintSink::default());
        let mut handler = InteractionHandler::new(test_config(), hints.clone());
        assert!(handler.init_with_source(NeverIdle));

        handler.acquire(30);
        std::thread::sleep(Duration::from_millis(10));
        // Same duration, elapsed > 0 remaining margin: re-arms the window,
        // but the boost is still held so there is no second engage.
        handler.acquire(30);
        assert_eq!(hints.engage_count("INTERACTION"), 1);

        // Once the second window runs out the boost is released exactly once.
        std::thread::sleep(Duration::from_millis(120));
        let calls = hints.calls();
        assert_eq!(
            calls
                .iter()
                .filter(|c| matches!(c, HintCall::End(_)))
                .count(),
            1
        );
        handler.exit();
    }

    #[test]
    fn test_released_on_idle_detection() {
        let hints = Arc::new(MockHintSink::default());
        let mut handler = InteractionHandler::new(test_config(), hints.clone());
        assert!(handler.init_with_source(InstantIdle));

        handler.acquire(100);
        std::thread::sleep(Duration::from_millis(50));
        let calls = hints.calls();
        assert_eq!(calls.first(), Some(&HintCall::Do("INTERACTION".into(), None)));
        assert!(calls.contains(&HintCall::End("INTERACTION".into())));
        handler.exit();
    }

    #[test]
    fn test_reengages_after_release() {
        let hints = Arc::new(MockHintSink::default());
        let mut handler = InteractionHandler::new(test_config(), hints.clone());
        assert!(handler.init_with_source(InstantIdle));

        handler.acquire(100);
        std::thread::sleep(Duration::from_millis(50));
        handler.acquire(100);
        std::thread::sleep(Duration::from_millis(20));
        assert!(hints.engage_count("INTERACTION") >= 2);
        handler.exit();
    }

    #[test]
    fn test_exit_stops_thread() {
        let hints = Arc::new(MockHintSink::default());
        let mut handler = InteractionHandler::new(test_config(), hints.clone());
        assert!(handler.init_with_source(NeverIdle));
        handler.acquire(100);
        // Exit must interrupt the in-flight 100ms wait well before it ends.
        let start = Instant::now();
        handler.exit();
        assert!(start.elapsed() < Duration::from_millis(80));
    }
}
