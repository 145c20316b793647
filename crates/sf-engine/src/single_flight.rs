//! Per-key deduplication of concurrent computations.
//!
//! The first caller for a key becomes the leader and runs the computation;
//! callers arriving while it is in flight block on a condvar and receive a
//! clone of the leader's value. Different keys never contend beyond the short
//! map lock.
//!
//! If the leader unwinds without producing a value, the call is marked
//! abandoned and waiting followers retry, one of them taking over as leader.
//!
//! A leader that stops waiting on a worker (a timeout) releases its slot while
//! the worker is still running. [`DrainSet`] tracks such workers per key so the
//! next leader can wait for them to exit before starting its own.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// How a caller obtained its value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Leader,
    Follower,
}

#[derive(Debug)]
enum State<V> {
    Pending,
    Done(V),
    Abandoned,
}

#[derive(Debug)]
struct Call<V> {
    state: Mutex<State<V>>,
    settled: Condvar,
}

impl<V: Clone> Call<V> {
    fn new() -> Self {
        Self {
            state: Mutex::new(State::Pending),
            settled: Condvar::new(),
        }
    }

    fn settle(&self, state: State<V>) {
        *lock(&self.state) = state;
        self.settled.notify_all();
    }

    /// `None` if the leader gave up.
    fn wait(&self) -> Option<V> {
        let mut state = lock(&self.state);
        while matches!(*state, State::Pending) {
            state = self
                .settled
                .wait(state)
                .unwrap_or_else(|p| p.into_inner());
        }
        match &*state {
            State::Done(value) => Some(value.clone()),
            _ => None,
        }
    }
}

enum Slot<V> {
    Lead(Arc<Call<V>>),
    Follow(Arc<Call<V>>),
}

#[derive(Debug)]
pub struct SingleFlight<K, V> {
    calls: Mutex<HashMap<K, Arc<Call<V>>>>,
}

impl<K, V> Default for SingleFlight<K, V> {
    fn default() -> Self {
        Self {
            calls: Mutex::new(HashMap::new()),
        }
    }
}

impl<K: Eq + Hash + Clone, V: Clone> SingleFlight<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` for `key` unless a call for it is already in flight, in which
    /// case wait for that call's value instead.
    pub fn run<F: FnOnce() -> V>(&self, key: K, f: F) -> (V, Role) {
        let call = loop {
            match self.join_or_lead(&key) {
                Slot::Lead(call) => break call,
                Slot::Follow(call) => {
                    if let Some(value) = call.wait() {
                        return (value, Role::Follower);
                    }
                }
            }
        };

        let mut guard = LeadGuard {
            flight: self,
            key: &key,
            call: &call,
            settled: false,
        };
        let value = f();
        self.forget(&key, &call);
        call.settle(State::Done(value.clone()));
        guard.settled = true;

        (value, Role::Leader)
    }

    /// Number of keys with a computation in flight.
    pub fn in_flight(&self) -> usize {
        lock(&self.calls).len()
    }

    fn join_or_lead(&self, key: &K) -> Slot<V> {
        let mut calls = lock(&self.calls);
        if let Some(call) = calls.get(key) {
            return Slot::Follow(Arc::clone(call));
        }
        let call = Arc::new(Call::new());
        calls.insert(key.clone(), Arc::clone(&call));
        Slot::Lead(call)
    }

    fn forget(&self, key: &K, call: &Arc<Call<V>>) {
        let mut calls = lock(&self.calls);
        if calls.get(key).is_some_and(|current| Arc::ptr_eq(current, call)) {
            calls.remove(key);
        }
    }
}

struct LeadGuard<'a, K: Eq + Hash + Clone, V: Clone> {
    flight: &'a SingleFlight<K, V>,
    key: &'a K,
    call: &'a Arc<Call<V>>,
    settled: bool,
}

impl<K: Eq + Hash + Clone, V: Clone> Drop for LeadGuard<'_, K, V> {
    fn drop(&mut self) {
        if !self.settled {
            self.flight.forget(self.key, self.call);
            self.call.settle(State::Abandoned);
        }
    }
}

/// Per-key count of workers that outlived the caller waiting on them.
#[derive(Debug)]
pub struct DrainSet<K> {
    busy: Mutex<HashMap<K, usize>>,
    idle: Condvar,
}

impl<K> Default for DrainSet<K> {
    fn default() -> Self {
        Self {
            busy: Mutex::new(HashMap::new()),
            idle: Condvar::new(),
        }
    }
}

impl<K: Eq + Hash + Clone> DrainSet<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `key` busy until the returned hold is dropped.
    pub fn hold(self: &Arc<Self>, key: K) -> DrainHold<K> {
        *lock(&self.busy).entry(key.clone()).or_insert(0) += 1;
        DrainHold {
            set: Arc::clone(self),
            key,
        }
    }

    pub fn is_busy(&self, key: &K) -> bool {
        lock(&self.busy).contains_key(key)
    }

    /// Number of keys with at least one worker still running.
    pub fn len(&self) -> usize {
        lock(&self.busy).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Block until no worker holds `key`. Returns `false` if `limit` elapsed
    /// first.
    pub fn wait_idle(&self, key: &K, limit: Option<Duration>) -> bool {
        let deadline = limit.map(|limit| Instant::now() + limit);
        let mut busy = lock(&self.busy);
        while busy.contains_key(key) {
            match deadline {
                None => {
                    busy = self.idle.wait(busy).unwrap_or_else(|p| p.into_inner());
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    busy = self
                        .idle
                        .wait_timeout(busy, deadline - now)
                        .unwrap_or_else(|p| p.into_inner())
                        .0;
                }
            }
        }
        true
    }

    fn release(&self, key: &K) {
        let mut busy = lock(&self.busy);
        if let Some(count) = busy.get_mut(key) {
            *count -= 1;
            if *count == 0 {
                busy.remove(key);
            }
        }
        drop(busy);
        self.idle.notify_all();
    }
}

/// Keeps a key busy in its [`DrainSet`]; released on drop, including unwind.
#[derive(Debug)]
pub struct DrainHold<K: Eq + Hash + Clone> {
    set: Arc<DrainSet<K>>,
    key: K,
}

impl<K: Eq + Hash + Clone> Drop for DrainHold<K> {
    fn drop(&mut self) {
        self.set.release(&self.key);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|p| p.into_inner())
}
