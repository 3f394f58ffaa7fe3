use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::bitset::TypeIndex;
use crate::component::ComponentRegistry;
use crate::error::{EngineError, EngineResult};
use crate::inner_executor;
use crate::latch::CounterLatch;
use crate::raw_ptr::RawRef;
use crate::system::{SystemDecl, SystemId, SystemInstance};
use crate::thread_pool::ThreadPool;

/// The static dependency DAG derived from system declarations: for each
/// system, the list of systems that depend on it. Built once at engine
/// construction and never mutated afterward.
pub struct Dag {
    dependents: Vec<Vec<SystemId>>,
}

impl Dag {
    /// Validates acyclicity and the static read/write non-conflict
    /// precondition (P4), then builds the reverse-edge adjacency used to
    /// fan out at dispatch time.
    pub fn build(decls: &[SystemDecl]) -> EngineResult<Self> {
        let n = decls.len();
        for decl in decls {
            for &dep in &decl.dependencies {
                if dep >= n {
                    return Err(EngineError::UnknownTag);
                }
            }
        }

        let mut dependents: Vec<Vec<SystemId>> = vec![Vec::new(); n];
        let mut in_degree = vec![0u32; n];
        for decl in decls {
            in_degree[decl.id] = decl.dependencies.len() as u32;
            for &dep in &decl.dependencies {
                dependents[dep].push(decl.id);
            }
        }

        let mut remaining = in_degree.clone();
        let mut queue: VecDeque<SystemId> =
            (0..n).filter(|&i| remaining[i] == 0).collect();
        let mut visited = 0usize;
        while let Some(u) = queue.pop_front() {
            visited += 1;
            for &v in &dependents[u] {
                remaining[v] -= 1;
                if remaining[v] == 0 {
                    queue.push_back(v);
                }
            }
        }
        if visited != n {
            return Err(EngineError::CyclicDependency);
        }

        let ancestors = Self::transitive_dependencies(decls);
        for u in 0..n {
            for v in (u + 1)..n {
                let related = ancestors[v].contains(&u) || ancestors[u].contains(&v);
                if related {
                    continue;
                }
                let conflict = (decls[u].writes & (decls[v].reads | decls[v].writes)).any()
                    || (decls[v].writes & (decls[u].reads | decls[u].writes)).any();
                if conflict {
                    return Err(EngineError::ConflictingSystems(u, v));
                }
            }
        }

        Ok(Self { dependents })
    }

    fn transitive_dependencies(decls: &[SystemDecl]) -> Vec<HashSet<SystemId>> {
        let n = decls.len();
        let mut ancestors: Vec<HashSet<SystemId>> = vec![HashSet::new(); n];
        fn visit(
            id: SystemId,
            decls: &[SystemDecl],
            ancestors: &mut Vec<HashSet<SystemId>>,
            done: &mut Vec<bool>,
        ) {
            if done[id] {
                return;
            }
            for &dep in &decls[id].dependencies {
                visit(dep, decls, ancestors, done);
                ancestors[id].insert(dep);
                let dep_ancestors = ancestors[dep].clone();
                ancestors[id].extend(dep_ancestors);
            }
            done[id] = true;
        }
        let mut done = vec![false; n];
        for id in 0..n {
            visit(id, decls, &mut ancestors, &mut done);
        }
        ancestors
    }

    /// BFS over dependent edges starting at `roots`; returns the reached
    /// mask and the number of systems reached.
    fn reachable_from(&self, roots: &[SystemId]) -> (Vec<bool>, usize) {
        let n = self.dependents.len();
        let mut reached = vec![false; n];
        let mut queue = VecDeque::new();
        for &r in roots {
            if !reached[r] {
                reached[r] = true;
                queue.push_back(r);
            }
        }
        let mut count = 0;
        while let Some(u) = queue.pop_front() {
            count += 1;
            for &v in &self.dependents[u] {
                if !reached[v] {
                    reached[v] = true;
                    queue.push_back(v);
                }
            }
        }
        (reached, count)
    }
}

/// Per-call shared state threaded through every job dispatched while
/// running one `execute_systems_from`.
struct RunContext {
    dag: RawRef<Dag>,
    systems: RawRef<[SystemInstance]>,
    components: RawRef<ComponentRegistry>,
    type_index: RawRef<TypeIndex>,
    pool: RawRef<ThreadPool>,
    worker_count: usize,
    inner_parallelism_allowed: bool,
    reached: Vec<bool>,
    remaining_deps: Vec<AtomicU32>,
    outer_latch: Arc<CounterLatch>,
    first_error: Mutex<Option<EngineError>>,
    failed: AtomicBool,
}

fn run_task(ctx: Arc<RunContext>, sid: SystemId) {
    log::trace!("system {sid}: task start");
    // Once any system has failed, downstream tasks are still scheduled to
    // keep the counters (and the outer latch) converging, but their
    // bodies don't run: their outputs, kill sets, and deferred closures
    // would be discarded at refresh anyway (§4.8/§7).
    if !ctx.failed.load(Ordering::Acquire) {
        let systems = unsafe { ctx.systems.get() };
        let components = unsafe { ctx.components.get() };
        let type_index = unsafe { ctx.type_index.get() };
        let pool = unsafe { ctx.pool.get() };

        let err = inner_executor::dispatch(
            &systems[sid],
            components,
            type_index,
            systems,
            pool,
            ctx.worker_count,
            ctx.inner_parallelism_allowed,
        );
        if let Some(err) = err {
            log::warn!("system {sid}: failed, dropping its output and every unreached dependent's body: {err}");
            ctx.failed.store(true, Ordering::Release);
            let mut slot = ctx.first_error.lock();
            if slot.is_none() {
                *slot = Some(err);
            }
        }
    } else {
        log::trace!("system {sid}: skipped, an earlier system already failed");
    }

    let dag = unsafe { ctx.dag.get() };
    let pool = unsafe { ctx.pool.get() };
    ctx.outer_latch.notify();
    log::trace!("system {sid}: task finish");

    for &dsid in &dag.dependents[sid] {
        if !ctx.reached[dsid] {
            continue;
        }
        let prev = ctx.remaining_deps[dsid].fetch_sub(1, Ordering::AcqRel);
        if prev == 1 {
            let next_ctx = ctx.clone();
            let job: crate::thread_pool::Job = Box::new(move || run_task(next_ctx, dsid));
            // The scheduler's completion signal is the shared outer latch;
            // every task notifies it directly, so the per-job latch here
            // (limit 0) is never waited on by anyone.
            pool.submit(job, Arc::new(CounterLatch::new(0)));
        }
    }
}

/// Drives the static system DAG to completion for one step (C8).
pub struct OuterScheduler {
    dag: Dag,
}

impl OuterScheduler {
    pub fn new(decls: &[SystemDecl]) -> EngineResult<Self> {
        Ok(Self { dag: Dag::build(decls)? })
    }

    /// Runs every system reachable from `roots` respecting declared
    /// dependencies, fanning independent systems out across `pool`.
    /// Blocks until the whole reachable subgraph has completed.
    #[allow(clippy::too_many_arguments)]
    pub fn execute_systems_from(
        &self,
        systems: &[SystemInstance],
        components: &ComponentRegistry,
        type_index: &TypeIndex,
        pool: &ThreadPool,
        worker_count: usize,
        inner_parallelism_allowed: bool,
        roots: &[SystemId],
    ) -> EngineResult<()> {
        if roots.is_empty() {
            return Ok(());
        }

        let (reached, reachable_count) = self.dag.reachable_from(roots);
        let remaining_deps: Vec<AtomicU32> = systems
            .iter()
            .enumerate()
            .map(|(id, instance)| {
                let count = if reached[id] {
                    instance
                        .decl
                        .dependencies
                        .iter()
                        .filter(|&&dep| reached[dep])
                        .count()
                } else {
                    0
                };
                AtomicU32::new(count as u32)
            })
            .collect();

        let outer_latch = Arc::new(CounterLatch::new(reachable_count as u32));
        let ctx = Arc::new(RunContext {
            dag: RawRef::new(&self.dag),
            systems: RawRef::new(systems),
            components: RawRef::new(components),
            type_index: RawRef::new(type_index),
            pool: RawRef::new(pool),
            worker_count,
            inner_parallelism_allowed,
            reached,
            remaining_deps,
            outer_latch: outer_latch.clone(),
            first_error: Mutex::new(None),
            failed: AtomicBool::new(false),
        });

        for &root in roots {
            let ctx = ctx.clone();
            let job: crate::thread_pool::Job = Box::new(move || run_task(ctx, root));
            pool.submit(job, Arc::new(CounterLatch::new(0)));
        }

        outer_latch.wait();

        match Arc::try_unwrap(ctx) {
            Ok(ctx) => match ctx.first_error.into_inner() {
                Some(err) => Err(err),
                None => Ok(()),
            },
            Err(ctx) => match ctx.first_error.lock().take() {
                Some(err) => Err(err),
                None => Ok(()),
            },
        }
    }
}
