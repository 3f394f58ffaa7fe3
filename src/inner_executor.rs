use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::bitset::TypeIndex;
use crate::component::ComponentRegistry;
use crate::error::EngineError;
use crate::latch::CounterLatch;
use crate::raw_ptr::RawRef;
use crate::system::{DataProxy, InnerParallelism, SystemInstance};
use crate::thread_pool::ThreadPool;

/// Resolve a subtask count `k` from a system's declared policy (§4.7).
fn resolve_k(policy: &InnerParallelism, n: usize, worker_count: usize) -> usize {
    match policy {
        InnerParallelism::None => 1,
        InnerParallelism::SplitN(m) => (*m).min(n.max(1)),
        InnerParallelism::SplitEvenlyCores => worker_count.max(1).min(n.max(1)),
        InnerParallelism::NoneBelowThreshold(t, inner) => {
            if n < *t {
                1
            } else {
                resolve_k(inner, n, worker_count)
            }
        }
    }
}

/// Contiguous slice bounds for `k` subtasks over `n` entities. The first
/// `n % k` slices absorb one extra entity each; this is the distribution
/// that reproduces the spec's worked example (n=10, k=4 -> {3,3,2,2}).
fn slice_bounds(n: usize, k: usize) -> Vec<(usize, usize)> {
    if k == 0 {
        return Vec::new();
    }
    let base = n / k;
    let rem = n % k;
    let mut bounds = Vec::with_capacity(k);
    let mut cursor = 0;
    for i in 0..k {
        let size = if i < rem { base + 1 } else { base };
        bounds.push((cursor, cursor + size));
        cursor += size;
    }
    bounds
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "system panicked with a non-string payload".to_owned()
    }
}

/// Runs one slice of the subscribed set through the system's logic,
/// recording the first panic into `first_error`.
fn run_slice(
    index: usize,
    begin: usize,
    end: usize,
    ids: &[u32],
    instance: &SystemInstance,
    components: &ComponentRegistry,
    type_index: &TypeIndex,
    systems: &[SystemInstance],
    first_error: &Mutex<Option<EngineError>>,
) {
    let slice = &ids[begin..end];
    let subtask = unsafe { instance.subtask_state_mut(index) };
    let mut proxy = DataProxy::new(
        slice,
        components,
        type_index,
        instance.decl.reads,
        instance.decl.writes,
        subtask,
        systems,
    );
    let result = catch_unwind(AssertUnwindSafe(|| instance.logic.run(&mut proxy)));
    if let Err(payload) = result {
        let message = panic_message(&payload);
        let mut slot = first_error.lock();
        if slot.is_none() {
            *slot = Some(EngineError::UserError(message));
        }
    }
}

/// Runs one system's subscribed set, sliced into subtasks per its inner
/// parallelism policy, and blocks until all subtasks finish (C7).
///
/// Returns the first panic caught from a user closure, if any, matching
/// the outer scheduler's first-error-wins policy (§4.8/§7).
pub fn dispatch(
    instance: &SystemInstance,
    components: &ComponentRegistry,
    type_index: &TypeIndex,
    systems: &[SystemInstance],
    pool: &ThreadPool,
    worker_count: usize,
    inner_parallelism_allowed: bool,
) -> Option<EngineError> {
    let n = instance.subscribed.len();
    let k = if inner_parallelism_allowed {
        resolve_k(&instance.decl.inner_parallelism, n, worker_count)
    } else {
        1
    };

    unsafe {
        instance.prepare_subtask_states_unsafe(k);
    }

    let ids: Arc<Vec<u32>> = Arc::new(instance.subscribed.iter().collect());
    let bounds: Arc<Vec<(usize, usize)>> = Arc::new(slice_bounds(n, k));
    let latch = Arc::new(CounterLatch::new(k as u32));
    let first_error: Arc<Mutex<Option<EngineError>>> = Arc::new(Mutex::new(None));

    // SAFETY: every raw pointer captured below stays valid for the
    // duration of this call because `dispatch` blocks on `latch` before
    // returning, and nothing submitted after that point can still be
    // running a job holding one of these pointers.
    let instance_ptr = RawRef::new(instance);
    let components_ptr = RawRef::new(components);
    let type_index_ptr = RawRef::new(type_index);
    let systems_ptr = RawRef::new(systems);

    for i in 0..k.saturating_sub(1) {
        let ids = ids.clone();
        let bounds = bounds.clone();
        let first_error = first_error.clone();
        let latch_for_job = latch.clone();
        let job: crate::thread_pool::Job = Box::new(move || {
            let instance = unsafe { instance_ptr.get() };
            let components = unsafe { components_ptr.get() };
            let type_index = unsafe { type_index_ptr.get() };
            let systems = unsafe { systems_ptr.get() };
            let (begin, end) = bounds[i];
            run_slice(
                i,
                begin,
                end,
                &ids,
                instance,
                components,
                type_index,
                systems,
                &first_error,
            );
        });
        pool.submit(job, latch_for_job);
    }

    if k > 0 {
        let last = k - 1;
        let (begin, end) = bounds[last];
        run_slice(
            last,
            begin,
            end,
            &ids,
            instance,
            components,
            type_index,
            systems,
            &first_error,
        );
        latch.notify();
    }

    latch.wait();

    first_error.lock().take()
}
