use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::{Condvar, Mutex};

/// A reusable barrier: waits for a set number of `notify` calls, then
/// releases every waiter. The limit can be changed after construction,
/// which lets the scheduler size a latch to a subtask count decided at
/// dispatch time.
///
/// `notify` never resets `count` on its own — only `reset` does. This
/// matters because every caller in this crate calls `notify` for its own
/// share of the work *before* calling `wait` on the same thread (the local
/// last-slice idiom used by `inner_executor::dispatch`, `refresh.rs`'s R2/R3,
/// and the outer scheduler): if `notify` had zeroed the counter the instant
/// the limit was reached, a `wait` arriving after that reset would find
/// nothing left to observe and block forever. Testing `count < limit`
/// directly means a `wait` that starts after the limit was already reached
/// sees that immediately and never touches the condvar.
struct State {
    count: u32,
}

pub struct CounterLatch {
    cond: Condvar,
    state: Mutex<State>,
    limit: AtomicU32,
}

impl CounterLatch {
    pub fn new(limit: u32) -> Self {
        Self {
            cond: Condvar::new(),
            state: Mutex::new(State { count: 0 }),
            limit: AtomicU32::new(limit),
        }
    }

    pub fn limit(&self) -> u32 {
        self.limit.load(Ordering::Relaxed)
    }

    pub fn count(&self) -> u32 {
        self.state.lock().count
    }

    /// Zero the counter without changing the limit, for reuse.
    pub fn reset(&self) {
        self.state.lock().count = 0;
    }

    /// Record one notification; wakes every waiter once `limit` notifications
    /// have accumulated. Leaves `count` at its new value rather than
    /// resetting it — see the struct-level note on why.
    pub fn notify(&self) {
        let mut state = self.state.lock();
        state.count += 1;
        if state.count >= self.limit() {
            drop(state);
            self.cond.notify_all();
        }
    }

    /// Change the limit. If the current count already meets the new limit,
    /// waiters are released immediately.
    pub fn set_limit(&self, limit: u32) {
        self.limit.store(limit, Ordering::SeqCst);
        let state = self.state.lock();
        if limit == 0 || state.count >= limit {
            drop(state);
            self.cond.notify_all();
        }
    }

    /// Block the calling thread until `limit` notifications have arrived.
    /// Safe to call after every notification has already landed: the check
    /// is on the current count, not on a generation counter that could have
    /// already turned over.
    pub fn wait(&self) {
        let mut state = self.state.lock();
        if self.limit() == 0 {
            return;
        }
        while state.count < self.limit() {
            self.cond.wait(&mut state);
        }
    }
}
