// SPDX-License-Identifier: GPL-2.0
//
// Process-wide session registry.
//
// Owns the live session set, the tid -> session and tid -> refcount maps,
// and is the only component that talks to the scheduling primitive. Every
// floor application re-aggregates the per-thread maximum across sessions so
// removing or pausing one session can never drop a floor another session
// still holds on a shared thread.

use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use log::{debug, error, warn};
use rustc_hash::{FxHashMap, FxHashSet};

use crate::config::ProfileStore;
use crate::error::{SessionError, SessionResult};
use crate::hints::HintSink;
use crate::session::HintSession;
use crate::timer::{TimerHandle, TimerId};
use crate::uclamp::{FloorSetter, TaskProfile};

// Fixed identities for the registry's own timer events; session timers
// allocate above this range.
const BOOST_CHECK_TIMER: TimerId = 0;
const WAKE_SESSIONS_TIMER: TimerId = 1;

/// Everything the timer thread can be asked to deliver. Payloads are weak so
/// an in-flight event never keeps a closed session alive.
pub enum TimerEvent {
    StaleCheck(Weak<HintSession>),
    EarlyBoost(Weak<HintSession>),
    BoostCheck(Weak<SessionManager>),
    WakeSessions(Weak<SessionManager>),
}

/// Single dispatch entry point running on the timer thread.
pub fn dispatch_timer_event(event: TimerEvent) {
    match event {
        TimerEvent::StaleCheck(session) => {
            if let Some(session) = session.upgrade() {
                session.on_stale_timer();
            }
        }
        TimerEvent::EarlyBoost(session) => {
            if let Some(session) = session.upgrade() {
                session.on_early_boost_timer();
            }
        }
        TimerEvent::BoostCheck(manager) => {
            if let Some(manager) = manager.upgrade() {
                manager.evaluate_universal_boost();
            }
        }
        TimerEvent::WakeSessions(manager) => {
            if let Some(manager) = manager.upgrade() {
                manager.wake_sessions();
            }
        }
    }
}

struct Registry {
    sessions: FxHashMap<u64, Arc<HintSession>>,
    tid_sessions: FxHashMap<i32, FxHashSet<u64>>,
    tid_refcount: FxHashMap<i32, u32>,
    /// Debounce cache for the aggregate "any app session active" signal.
    app_active: bool,
    display_refresh_rate: u32,
}

pub struct SessionManager {
    registry: Mutex<Registry>,
    floor: Arc<dyn FloorSetter>,
    hints: Arc<dyn HintSink>,
    profiles: Arc<ProfileStore>,
    timer: TimerHandle<TimerEvent>,
    disable_boost_hint: String,
    next_session_id: AtomicU64,
    weak: Weak<SessionManager>,
}

impl SessionManager {
    pub fn new(
        floor: Arc<dyn FloorSetter>,
        hints: Arc<dyn HintSink>,
        profiles: Arc<ProfileStore>,
        timer: TimerHandle<TimerEvent>,
        disable_boost_hint: String,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            registry: Mutex::new(Registry {
                sessions: FxHashMap::default(),
                tid_sessions: FxHashMap::default(),
                tid_refcount: FxHashMap::default(),
                app_active: false,
                display_refresh_rate: 60,
            }),
            floor,
            hints,
            profiles,
            timer,
            disable_boost_hint,
            next_session_id: AtomicU64::new(1),
            weak: weak.clone(),
        })
    }

    /// Session API: open a new hint session. The session starts active with
    /// the configured startup floor applied to all of its threads.
    pub fn create_session(
        &self,
        tgid: i32,
        uid: i32,
        tids: Vec<i32>,
        target_ns: i64,
    ) -> SessionResult<Arc<HintSession>> {
        if tids.is_empty() {
            return Err(SessionError::IllegalArgument("no thread ids given"));
        }
        if target_ns <= 0 {
            return Err(SessionError::IllegalArgument("target must be positive"));
        }
        let id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
        let session = HintSession::new(
            id,
            tgid,
            uid,
            tids,
            target_ns,
            self.weak.clone(),
            self.timer.clone(),
            Arc::clone(&self.profiles),
        );
        self.add_session(&session);
        session.set_uclamp_min(self.profiles.current().uclamp_min_init);
        debug!("session created: {}", session.tag());
        Ok(session)
    }

    fn add_session(&self, session: &Arc<HintSession>) {
        let mut reg = self.registry.lock().unwrap();
        for &tid in session.tids() {
            reg.tid_sessions
                .entry(tid)
                .or_default()
                .insert(session.id());
            match reg.tid_refcount.get_mut(&tid) {
                None => {
                    if self.floor.set_task_profile(tid, TaskProfile::ResetUclampGrp) {
                        reg.tid_refcount.insert(tid, 1);
                    } else {
                        warn!("Failed to set ResetUclampGrp task profile for tid:{}", tid);
                    }
                }
                Some(count) => *count += 1,
            }
        }
        reg.sessions.insert(session.id(), Arc::clone(session));
    }

    pub(crate) fn remove_session(&self, session: &HintSession) {
        let mut reg = self.registry.lock().unwrap();
        for &tid in session.tids() {
            if let Some(set) = reg.tid_sessions.get_mut(&tid) {
                set.remove(&session.id());
                if set.is_empty() {
                    reg.tid_sessions.remove(&tid);
                }
            }
            match reg.tid_refcount.get_mut(&tid) {
                None => {
                    error!("Failed to look up tid:{} in the refcount map", tid);
                }
                Some(count) => {
                    *count -= 1;
                    if *count == 0 {
                        if !self
                            .floor
                            .set_task_profile(tid, TaskProfile::NoResetUclampGrp)
                        {
                            warn!("Failed to set NoResetUclampGrp task profile for tid:{}", tid);
                        }
                        reg.tid_refcount.remove(&tid);
                    }
                }
            }
        }
        reg.sessions.remove(&session.id());
    }

    /// Apply `val` for every thread of `session`, folded against the maximum
    /// floor requested by all other active, non-stale sessions sharing the
    /// thread. Runs entirely under the registry lock so the aggregation is
    /// atomic with respect to the kernel writes.
    pub(crate) fn set_floor(&self, session: &HintSession, val: u32) {
        if !self.profiles.current().uclamp_min_on {
            return;
        }
        let reg = self.registry.lock().unwrap();
        for &tid in session.tids() {
            let mut tid_max = 0u32;
            if let Some(ids) = reg.tid_sessions.get(&tid) {
                for sid in ids {
                    if let Some(s) = reg.sessions.get(sid) {
                        if !s.is_active() || s.is_stale() {
                            continue;
                        }
                        tid_max = tid_max.max(s.current_min());
                    }
                }
            }
            self.floor.set_min(tid, val.max(tid_max));
        }
    }

    /// Queue a debounced re-evaluation of the coarse system boost on the
    /// timer thread. Back-to-back requests collapse into one delivery.
    pub(crate) fn schedule_boost_check(&self) {
        self.timer
            .arm_now(BOOST_CHECK_TIMER, TimerEvent::BoostCheck(self.weak.clone()));
    }

    /// Returns the new aggregate value only when it changed since the last
    /// check, so callers can skip redundant coarse-boost toggling.
    fn is_any_app_session_active(&self) -> Option<bool> {
        let mut reg = self.registry.lock().unwrap();
        let active = reg
            .sessions
            .values()
            .any(|s| s.is_active() && !s.is_stale() && s.is_app_session());
        if active == reg.app_active {
            None
        } else {
            reg.app_active = active;
            Some(active)
        }
    }

    /// An active deadline-aware app session suppresses the blanket top-app
    /// boost that would otherwise waste power; it comes back when the last
    /// such session goes away.
    pub(crate) fn evaluate_universal_boost(&self) {
        match self.is_any_app_session_active() {
            None => {}
            Some(true) => {
                if self.hints.is_supported(&self.disable_boost_hint) {
                    debug!("suppressing system top-app boost");
                    self.hints.do_hint(&self.disable_boost_hint, None);
                }
            }
            Some(false) => {
                if self.hints.is_supported(&self.disable_boost_hint) {
                    debug!("restoring system top-app boost");
                    self.hints.end_hint(&self.disable_boost_hint);
                }
            }
        }
    }

    /// Platform mode change. REFRESH_* modes track the display refresh rate
    /// and re-select the matching tuning profile.
    pub fn update_hint_mode(&self, mode: &str, enabled: bool) {
        debug!("update hint mode: {} enabled: {}", mode, enabled);
        if enabled && mode.starts_with("REFRESH_") {
            let rate = match mode {
                "REFRESH_120FPS" => Some(120),
                "REFRESH_90FPS" => Some(90),
                "REFRESH_60FPS" => Some(60),
                _ => None,
            };
            if let Some(rate) = rate {
                self.registry.lock().unwrap().display_refresh_rate = rate;
            }
        }
        self.profiles.select(mode);
    }

    /// Platform boost event. A display update being imminent wakes stale
    /// sessions so they are boosted before the frame starts.
    pub fn update_hint_boost(&self, boost: &str, duration_ms: i32) {
        debug!("update hint boost: {} duration: {}ms", boost, duration_ms);
        if boost == "DISPLAY_UPDATE_IMMINENT" {
            self.timer.arm_now(
                WAKE_SESSIONS_TIMER,
                TimerEvent::WakeSessions(self.weak.clone()),
            );
        }
    }

    fn wake_sessions(&self) {
        // Snapshot under the registry lock, wake outside it: wakeup() takes
        // the session lock and then re-enters the registry, and the lock
        // order is session before registry everywhere.
        let sessions: Vec<Arc<HintSession>> = {
            let reg = self.registry.lock().unwrap();
            reg.sessions.values().cloned().collect()
        };
        for session in sessions {
            session.wakeup();
        }
    }

    pub fn display_refresh_rate(&self) -> u32 {
        self.registry.lock().unwrap().display_refresh_rate
    }

    pub fn session_count(&self) -> usize {
        self.registry.lock().unwrap().sessions.len()
    }

    /// Human-readable listing of all live sessions and their thread sharing.
    pub fn dump(&self) -> String {
        let reg = self.registry.lock().unwrap();
        let mut buf = String::new();
        buf.push_str("========== Begin SessionManager ADPF list ==========\n");
        let mut ids: Vec<&u64> = reg.sessions.keys().collect();
        ids.sort_unstable();
        for id in ids {
            let session = &reg.sessions[id];
            buf.push_str(&session.dump_line());
            buf.push_str(" Tid:Ref[");
            for (i, tid) in session.tids().iter().enumerate() {
                let refs = reg.tid_sessions.get(tid).map_or(0, |s| s.len());
                if i > 0 {
                    buf.push_str(", ");
                }
                let _ = write!(buf, "{}:{}", tid, refs);
            }
            buf.push_str("]\n");
        }
        buf.push_str("========== End SessionManager ADPF list ==========\n");
        buf
    }
}
