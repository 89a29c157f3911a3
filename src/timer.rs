// SPDX-License-Identifier: GPL-2.0
//
// Delayed-event scheduling on a single dedicated thread.
//
// There is no fixed tick: the worker sleeps until the nearest armed deadline
// or until a control message changes it, then dispatches exactly the events
// whose deadline has passed. Arming an id that already has a pending entry
// replaces it (timers are not additive); cancellation is lazy, superseded
// heap entries are dropped when they surface.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering as MemOrdering};
use std::thread::JoinHandle;
use std::time::Instant;

use anyhow::{Context, Result};
use crossbeam::channel::{self, RecvTimeoutError, Sender};
use log::warn;
use rustc_hash::FxHashMap;

pub type TimerId = u64;

static NEXT_TIMER_ID: AtomicU64 = AtomicU64::new(16);

/// Allocate a process-unique timer identity. Ids below 16 are reserved for
/// fixed singleton events.
pub fn alloc_timer_id() -> TimerId {
    NEXT_TIMER_ID.fetch_add(1, MemOrdering::Relaxed)
}

enum Ctl<E> {
    Arm {
        id: TimerId,
        deadline: Instant,
        event: E,
    },
    Cancel {
        id: TimerId,
    },
    Shutdown,
}

struct Entry<E> {
    deadline: Instant,
    gen: u64,
    id: TimerId,
    event: E,
}

impl<E> PartialEq for Entry<E> {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.gen == other.gen
    }
}

impl<E> Eq for Entry<E> {}

impl<E> PartialOrd for Entry<E> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<E> Ord for Entry<E> {
    // Reversed so the BinaryHeap pops the earliest deadline first.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then(other.gen.cmp(&self.gen))
    }
}

/// Cheap cloneable handle for arming and cancelling timers from any thread.
pub struct TimerHandle<E> {
    tx: Sender<Ctl<E>>,
}

impl<E> Clone for TimerHandle<E> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<E: Send + 'static> TimerHandle<E> {
    /// Arm (or re-arm) timer `id` to fire `event` at `deadline`. Any pending
    /// entry for the same id is superseded.
    pub fn arm(&self, id: TimerId, deadline: Instant, event: E) {
        let _ = self.tx.send(Ctl::Arm {
            id,
            deadline,
            event,
        });
    }

    /// Arm `id` to fire as soon as the worker gets to it.
    pub fn arm_now(&self, id: TimerId, event: E) {
        self.arm(id, Instant::now(), event);
    }

    pub fn cancel(&self, id: TimerId) {
        let _ = self.tx.send(Ctl::Cancel { id });
    }
}

/// Owner of the dedicated timer thread.
pub struct TimerThread<E> {
    handle: TimerHandle<E>,
    worker: Option<JoinHandle<()>>,
}

impl<E: Send + 'static> TimerThread<E> {
    /// Spawn the worker. `dispatch` runs on the worker thread for every
    /// fired event, in deadline order.
    pub fn spawn<F>(name: &str, mut dispatch: F) -> Result<Self>
    where
        F: FnMut(E) + Send + 'static,
    {
        let (tx, rx) = channel::unbounded::<Ctl<E>>();
        let worker = std::thread::Builder::new()
            .name(name.into())
            .spawn(move || {
                let mut heap: BinaryHeap<Entry<E>> = BinaryHeap::new();
                // Latest generation per armed id; entries with a stale
                // generation were superseded or cancelled.
                let mut armed: FxHashMap<TimerId, u64> = FxHashMap::default();
                let mut next_gen: u64 = 0;

                loop {
                    let now = Instant::now();
                    while let Some(head) = heap.peek() {
                        if head.deadline > now {
                            break;
                        }
                        let entry = heap.pop().unwrap();
                        if armed.get(&entry.id) == Some(&entry.gen) {
                            armed.remove(&entry.id);
                            dispatch(entry.event);
                        }
                    }

                    let msg = match heap.peek() {
                        Some(head) => {
                            let wait = head.deadline.saturating_duration_since(Instant::now());
                            match rx.recv_timeout(wait) {
                                Ok(msg) => msg,
                                Err(RecvTimeoutError::Timeout) => continue,
                                Err(RecvTimeoutError::Disconnected) => break,
                            }
                        }
                        None => match rx.recv() {
                            Ok(msg) => msg,
                            Err(_) => break,
                        },
                    };

                    match msg {
                        Ctl::Arm {
                            id,
                            deadline,
                            event,
                        } => {
                            next_gen += 1;
                            armed.insert(id, next_gen);
                            heap.push(Entry {
                                deadline,
                                gen: next_gen,
                                id,
                                event,
                            });
                        }
                        Ctl::Cancel { id } => {
                            armed.remove(&id);
                        }
                        Ctl::Shutdown => break,
                    }
                }
            })
            .with_context(|| format!("Failed to spawn timer thread {}", name))?;

        Ok(Self {
            handle: TimerHandle { tx },
            worker: Some(worker),
        })
    }

    pub fn handle(&self) -> TimerHandle<E> {
        self.handle.clone()
    }

    /// Stop the worker and wait for it to drain. Pending timers are dropped.
    pub fn shutdown(mut self) {
        let _ = self.handle.tx.send(Ctl::Shutdown);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("timer thread panicked");
            }
        }
    }
}

impl<E> Drop for TimerThread<E> {
    fn drop(&mut self) {
        let _ = self.handle.tx.send(Ctl::Shutdown);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}
