// SPDX-License-Identifier: GPL-2.0
//
// Hint sessions: one per client-declared group of threads working against a
// periodic deadline. Reported actual durations feed a windowed PID controller
// whose output moves the session's requested utilization floor.
//
// Fields the registry reads during floor aggregation (activity, staleness
// inputs, current floor) are atomics so aggregation never has to take the
// per-session lock; everything else is serialized by `state`.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use log::{debug, warn};
use once_cell::sync::Lazy;

use crate::config::{AdpfProfile, ProfileStore};
use crate::error::{SessionError, SessionResult};
use crate::manager::{SessionManager, TimerEvent};
use crate::timer::{alloc_timer_id, TimerHandle, TimerId};

/// First uid in the range reserved for applications; platform/system uids
/// below it never gate the coarse boost.
pub(crate) const AID_APP_START: i32 = 10_000;

static MONO_EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

/// Nanoseconds on the process-local monotonic timeline.
pub(crate) fn mono_now_ns() -> i64 {
    MONO_EPOCH.elapsed().as_nanos() as i64
}

pub(crate) fn mono_instant(ns: i64) -> Instant {
    *MONO_EPOCH + Duration::from_nanos(ns.max(0) as u64)
}

/// One completed unit of work, as reported by the client.
#[derive(Debug, Clone, Copy)]
pub struct WorkDuration {
    /// Monotonic timestamp of the work's completion.
    pub timestamp_ns: i64,
    pub duration_ns: i64,
}

fn ns_to_100us(ns: i64) -> i64 {
    ns / 100_000
}

/// Convert a batch of actual durations into a floor adjustment.
///
/// Three trailing windows (P, I, D) select which samples feed each term; a
/// window length of zero means the whole batch. P and D gains are chosen by
/// the sign of the accumulated sum, the integral is clamped on every step.
/// Divisors are held at a minimum of 1 so degenerate windows or sub-100µs
/// targets cannot divide by zero.
fn convert_work_duration_to_boost(
    profile: &AdpfProfile,
    target_ns: i64,
    samples: &[WorkDuration],
    integral_error: &mut i64,
    previous_error: &mut i64,
    tag: &str,
) -> i64 {
    let length = samples.len() as i64;
    let window_start = |window: u64| -> i64 {
        let window = window as i64;
        if window == 0 || window > length {
            0
        } else {
            length - window
        }
    };
    let p_start = window_start(profile.sampling_window_p);
    let i_start = window_start(profile.sampling_window_i);
    let d_start = window_start(profile.sampling_window_d);
    let dt = ns_to_100us(target_ns).max(1);
    let integral_high = profile.integral_high();
    let integral_low = profile.integral_low();

    let mut err_sum: i64 = 0;
    let mut derivative_sum: i64 = 0;
    for i in p_start.min(i_start).min(d_start)..length {
        let actual_ns = samples[i as usize].duration_ns;
        if actual_ns.abs() > target_ns.saturating_mul(20) {
            warn!(
                "[{}] actual duration is way far from the target ({} >> {})",
                tag, actual_ns, target_ns
            );
        }
        let error = ns_to_100us(actual_ns - target_ns);
        if i >= d_start {
            derivative_sum += error - *previous_error;
        }
        if i >= p_start {
            err_sum += error;
        }
        if i >= i_start {
            *integral_error = (*integral_error + error * dt)
                .min(integral_high)
                .max(integral_low);
        }
        *previous_error = error;
    }

    let p_gain = if err_sum > 0 {
        profile.pid_po
    } else {
        profile.pid_pu
    };
    let d_gain = if derivative_sum > 0 {
        profile.pid_do
    } else {
        profile.pid_du
    };
    let p_out = (p_gain * err_sum as f64 / (length - p_start).max(1) as f64) as i64;
    let i_out = (profile.pid_i * *integral_error as f64) as i64;
    let d_out =
        (d_gain * derivative_sum as f64 / dt as f64 / (length - d_start).max(1) as f64) as i64;

    p_out + i_out + d_out
}

/// Work-period estimate and controller memory, serialized by the session lock.
struct SessionState {
    integral_error: i64,
    previous_error: i64,
    update_count: u64,
    last_started_ns: i64,
    last_duration_ns: i64,
    /// Exponential moving average of the observed workload period.
    work_period_ns: i64,
}

fn update_work_period(state: &mut SessionState, target_ns: i64, samples: &[WorkDuration]) {
    if samples.len() >= 2 {
        let last = &samples[samples.len() - 2];
        state.last_started_ns = last.timestamp_ns - last.duration_ns;
    }
    let current = match samples.last() {
        Some(s) => s,
        None => return,
    };
    let curr_start = current.timestamp_ns - current.duration_ns;
    let period = curr_start - state.last_started_ns;
    if period > 0 && period < target_ns.saturating_mul(2) {
        // Smooths over roughly the last ten workloads.
        state.work_period_ns = (0.9 * state.work_period_ns as f64 + 0.1 * period as f64) as i64;
    }
    state.last_started_ns = curr_start;
    state.last_duration_ns = current.duration_ns;
}

pub struct HintSession {
    id: u64,
    tag: String,
    tgid: i32,
    uid: i32,
    tids: Vec<i32>,
    closed: AtomicBool,
    active: AtomicBool,
    target_ns: AtomicI64,
    current_min: AtomicU32,
    last_updated_ns: AtomicI64,
    stale_deadline_ns: AtomicI64,
    boost_deadline_ns: AtomicI64,
    state: Mutex<SessionState>,
    stale_timer: TimerId,
    boost_timer: TimerId,
    weak: Weak<HintSession>,
    manager: Weak<SessionManager>,
    timer: TimerHandle<TimerEvent>,
    profiles: Arc<ProfileStore>,
}

impl HintSession {
    pub(crate) fn new(
        id: u64,
        tgid: i32,
        uid: i32,
        tids: Vec<i32>,
        target_ns: i64,
        manager: Weak<SessionManager>,
        timer: TimerHandle<TimerEvent>,
        profiles: Arc<ProfileStore>,
    ) -> Arc<Self> {
        let now = mono_now_ns();
        Arc::new_cyclic(|weak| Self {
            id,
            tag: format!("{}-{}-{}", tgid, uid, id),
            tgid,
            uid,
            tids,
            closed: AtomicBool::new(false),
            active: AtomicBool::new(true),
            target_ns: AtomicI64::new(target_ns),
            current_min: AtomicU32::new(0),
            last_updated_ns: AtomicI64::new(now),
            stale_deadline_ns: AtomicI64::new(0),
            boost_deadline_ns: AtomicI64::new(0),
            state: Mutex::new(SessionState {
                integral_error: 0,
                previous_error: 0,
                update_count: 0,
                last_started_ns: now - target_ns,
                last_duration_ns: target_ns,
                work_period_ns: target_ns,
            }),
            stale_timer: alloc_timer_id(),
            boost_timer: alloc_timer_id(),
            weak: weak.clone(),
            manager,
            timer,
            profiles,
        })
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn tgid(&self) -> i32 {
        self.tgid
    }

    pub fn tids(&self) -> &[i32] {
        &self.tids
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    pub fn current_min(&self) -> u32 {
        self.current_min.load(Ordering::Relaxed)
    }

    /// True when the deadline window since the last report has elapsed.
    pub fn is_stale(&self) -> bool {
        mono_now_ns() >= self.stale_time_ns()
    }

    pub(crate) fn is_app_session(&self) -> bool {
        self.uid >= AID_APP_START
    }

    fn stale_interval_ns(&self) -> i64 {
        let profile = self.profiles.current();
        (self.target_ns.load(Ordering::Relaxed) as f64 * profile.stale_time_factor) as i64
    }

    fn stale_time_ns(&self) -> i64 {
        self.last_updated_ns.load(Ordering::Relaxed) + self.stale_interval_ns()
    }

    fn arm_stale_timer(&self, deadline_ns: i64) {
        self.stale_deadline_ns.store(deadline_ns, Ordering::Relaxed);
        self.timer.arm(
            self.stale_timer,
            mono_instant(deadline_ns),
            TimerEvent::StaleCheck(self.weak.clone()),
        );
    }

    fn arm_boost_timer(&self, deadline_ns: i64) {
        self.boost_deadline_ns.store(deadline_ns, Ordering::Relaxed);
        self.timer.arm(
            self.boost_timer,
            mono_instant(deadline_ns),
            TimerEvent::EarlyBoost(self.weak.clone()),
        );
    }

    fn schedule_boost_check(&self) {
        if !self.is_app_session() {
            return;
        }
        if let Some(manager) = self.manager.upgrade() {
            manager.schedule_boost_check();
        }
    }

    /// Record the new requested floor, keep the stale timer running while the
    /// floor is non-zero, and push the change through the registry.
    pub(crate) fn set_uclamp_min(&self, min: u32) {
        self.current_min.store(min, Ordering::Relaxed);
        if min > 0 {
            self.arm_stale_timer(mono_now_ns() + self.stale_interval_ns());
        }
        if let Some(manager) = self.manager.upgrade() {
            manager.set_floor(self, min);
        }
    }

    pub fn pause(&self) -> SessionResult<()> {
        let _guard = self.state.lock().unwrap();
        if self.is_closed() {
            return Err(SessionError::IllegalState("session is dead"));
        }
        if !self.is_active() {
            return Err(SessionError::IllegalState("session already paused"));
        }
        self.active.store(false, Ordering::Relaxed);
        self.set_stale();
        self.schedule_boost_check();
        Ok(())
    }

    pub fn resume(&self) -> SessionResult<()> {
        let _guard = self.state.lock().unwrap();
        if self.is_closed() {
            return Err(SessionError::IllegalState("session is dead"));
        }
        if self.is_active() {
            return Err(SessionError::IllegalState("session already active"));
        }
        self.active.store(true, Ordering::Relaxed);
        // Restore the floor the session held before it was paused.
        self.set_uclamp_min(self.current_min());
        self.schedule_boost_check();
        Ok(())
    }

    pub fn update_target_work_duration(&self, target_ns: i64) -> SessionResult<()> {
        if self.is_closed() {
            return Err(SessionError::IllegalState("session is dead"));
        }
        if target_ns <= 0 {
            return Err(SessionError::IllegalArgument("target must be positive"));
        }
        let profile = self.profiles.current();
        let scaled = (target_ns as f64 * profile.target_time_factor) as i64;
        self.target_ns.store(scaled, Ordering::Relaxed);
        debug!("[{}] target duration updated to {} ns", self.tag, scaled);
        Ok(())
    }

    pub fn report_actual_work_duration(&self, samples: &[WorkDuration]) -> SessionResult<()> {
        if self.is_closed() {
            return Err(SessionError::IllegalState("session is dead"));
        }
        if self.target_ns.load(Ordering::Relaxed) == 0 {
            return Err(SessionError::IllegalState("no target duration set"));
        }
        if samples.is_empty() {
            return Err(SessionError::IllegalArgument("empty work duration batch"));
        }
        if !self.is_active() {
            return Err(SessionError::IllegalState("session is paused"));
        }

        let profile = self.profiles.current();
        let mut state = self.state.lock().unwrap();
        state.update_count += 1;
        let first_frame = self.is_stale();
        self.last_updated_ns.store(mono_now_ns(), Ordering::Relaxed);
        if first_frame {
            // Coming back from stale may flip the aggregate app-active state.
            self.schedule_boost_check();
        }

        if !profile.pid_on {
            self.set_uclamp_min(profile.uclamp_min_high);
            return Ok(());
        }

        let target_ns = self.target_ns.load(Ordering::Relaxed);
        // Reborrow the guard into a plain reference so the two disjoint field
        // borrows below don't each go through MutexGuard's DerefMut.
        let st = &mut *state;
        let output = convert_work_duration_to_boost(
            &profile,
            target_ns,
            samples,
            &mut st.integral_error,
            &mut st.previous_error,
            &self.tag,
        );
        let next_min = (self.current_min() as i64 + output)
            .min(profile.uclamp_min_high as i64)
            .max(profile.uclamp_min_low as i64) as u32;
        self.set_uclamp_min(next_min);
        self.arm_stale_timer(self.stale_time_ns());

        if profile.early_boost_on {
            update_work_period(&mut state, target_ns, samples);
            let timeout_ns = (target_ns as f64 * profile.early_boost_time_factor) as i64;
            let next_start = self.last_updated_ns.load(Ordering::Relaxed)
                + (state.work_period_ns - state.last_duration_ns);
            self.arm_boost_timer(next_start + timeout_ns);
        }
        Ok(())
    }

    pub fn close(&self) -> SessionResult<()> {
        if self
            .closed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(SessionError::IllegalState("session is dead"));
        }
        // Leave the registry first so a racing timer callback cannot observe
        // a half-torn-down session through the thread maps.
        if let Some(manager) = self.manager.upgrade() {
            manager.remove_session(self);
        }
        self.set_uclamp_min(0);
        self.active.store(false, Ordering::Relaxed);
        self.timer.cancel(self.stale_timer);
        self.timer.cancel(self.boost_timer);
        self.schedule_boost_check();
        Ok(())
    }

    /// Drop this session out of the aggregation without touching its
    /// remembered floor, so a later resume or wakeup can restore it.
    fn set_stale(&self) {
        if let Some(manager) = self.manager.upgrade() {
            manager.set_floor(self, 0);
        }
    }

    /// Stale timer fired. Deadlines move forward on every report, so a fire
    /// may be spurious; re-arm for the remainder instead of going stale.
    pub(crate) fn on_stale_timer(&self) {
        if self.is_closed() {
            return;
        }
        let deadline = self.stale_deadline_ns.load(Ordering::Relaxed);
        if mono_now_ns() < deadline {
            self.arm_stale_timer(deadline);
        } else {
            self.set_stale();
            self.schedule_boost_check();
        }
    }

    /// Early-boost timer fired: pre-raise the floor for the anticipated next
    /// period, bypassing the controller. The session's own floor memory is
    /// left alone.
    pub(crate) fn on_early_boost_timer(&self) {
        if self.is_closed() {
            return;
        }
        let deadline = self.boost_deadline_ns.load(Ordering::Relaxed);
        if mono_now_ns() < deadline {
            self.arm_boost_timer(deadline);
        } else {
            let profile = self.profiles.current();
            if let Some(manager) = self.manager.upgrade() {
                manager.set_floor(self, profile.uclamp_min_high);
            }
        }
    }

    /// A display update is imminent: bring stale-but-active sessions back up
    /// to at least the startup floor.
    pub(crate) fn wakeup(&self) {
        let _guard = self.state.lock().unwrap();
        if self.is_closed() || !self.is_active() || !self.is_stale() {
            return;
        }
        let profile = self.profiles.current();
        let min = self.current_min().max(profile.uclamp_min_init);
        self.set_uclamp_min(min);
    }

    pub(crate) fn dump_line(&self) -> String {
        format!(
            "ID.Min.Act.Timeout({}, {}, {}, {})",
            self.tag,
            self.current_min(),
            self.is_active(),
            self.is_stale()
        )
    }
}
