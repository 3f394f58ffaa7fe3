use std::sync::Arc;

use parking_lot::Mutex;

use crate::bitset::TypeIndex;
use crate::component::ComponentRegistry;
use crate::entity::{EntityId, EntityTable, Handle};
use crate::error::{EngineError, EngineResult};
use crate::latch::CounterLatch;
use crate::raw_ptr::RawRef;
use crate::scheduler::OuterScheduler;
use crate::sparse_set::SparseSet;
use crate::system::{SystemId, SystemInstance};
use crate::thread_pool::ThreadPool;

/// Side effects accumulated while running deferred closures (R1), folded
/// into the reclaim (R2) and rematch (R3) passes that follow.
#[derive(Default)]
pub struct RefreshState {
    to_kill: SparseSet,
    to_rematch: SparseSet,
}

impl RefreshState {
    pub fn new() -> Self {
        Self::default()
    }
}

/// User hooks fired at the point a subscription set or the entity table's
/// free list actually changes. Invoked from R2/R3, and from `StepProxy`'s
/// immediate `kill_entity`, which applies the same mutation eagerly.
#[derive(Default)]
pub struct RefreshHandlers {
    pub on_subscribe: Option<Box<dyn FnMut(SystemId, EntityId) + Send>>,
    pub on_unsubscribe: Option<Box<dyn FnMut(SystemId, EntityId) + Send>>,
    pub on_reclaim: Option<Box<dyn FnMut(EntityId) + Send>>,
}

impl RefreshHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    fn fire_subscribe(&mut self, sid: SystemId, id: EntityId) {
        if let Some(cb) = self.on_subscribe.as_mut() {
            cb(sid, id);
        }
    }

    fn fire_unsubscribe(&mut self, sid: SystemId, id: EntityId) {
        if let Some(cb) = self.on_unsubscribe.as_mut() {
            cb(sid, id);
        }
    }

    fn fire_reclaim(&mut self, id: EntityId) {
        if let Some(cb) = self.on_reclaim.as_mut() {
            cb(id);
        }
    }
}

/// Handed to the user's step body, and to each closure a system deferred
/// during its run, for immediate entity/component mutation plus the entry
/// points into DAG execution. Subscription-set updates these operations
/// imply are always folded into the refresh pass that follows — rematching
/// is a dedicated, parallel-across-systems step, never applied inline.
pub struct StepProxy<'a> {
    entities: &'a mut EntityTable,
    components: &'a ComponentRegistry,
    type_index: &'a TypeIndex,
    refresh: &'a mut RefreshState,
    systems: &'a [SystemInstance],
    handlers: &'a Mutex<RefreshHandlers>,
    scheduler: &'a OuterScheduler,
    pool: &'a ThreadPool,
    worker_count: usize,
    inner_parallelism_allowed: bool,
}

impl<'a> StepProxy<'a> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        entities: &'a mut EntityTable,
        components: &'a ComponentRegistry,
        type_index: &'a TypeIndex,
        refresh: &'a mut RefreshState,
        systems: &'a [SystemInstance],
        handlers: &'a Mutex<RefreshHandlers>,
        scheduler: &'a OuterScheduler,
        pool: &'a ThreadPool,
        worker_count: usize,
        inner_parallelism_allowed: bool,
    ) -> Self {
        Self {
            entities,
            components,
            type_index,
            refresh,
            systems,
            handlers,
            scheduler,
            pool,
            worker_count,
            inner_parallelism_allowed,
        }
    }

    /// Allocate a fresh entity id. Subscribed to whichever systems its
    /// (empty) bitset satisfies no earlier than the next refresh.
    pub fn create_entity(&mut self) -> EngineResult<EntityId> {
        let id = self.entities.create()?;
        self.refresh.to_rematch.insert(id);
        Ok(id)
    }

    /// Immediately unsubscribe `id` from every system and return it to the
    /// free list, bumping its generation. Distinct from
    /// `DataProxy::kill_entity`, which only queues `id` into this subtask's
    /// kill set for the next refresh's batched reclaim (R2).
    pub fn kill_entity(&mut self, id: EntityId) {
        if !self.entities.alive(id) {
            return;
        }
        let mut handlers = self.handlers.lock();
        for (sid, instance) in self.systems.iter().enumerate() {
            if unsafe { instance.subscribed_mut() }.remove(id) {
                handlers.fire_unsubscribe(sid, id);
            }
        }
        self.entities.reclaim(id);
        handlers.fire_reclaim(id);
        self.refresh.to_rematch.remove(id);
    }

    /// Insert a component. Fails with `DoubleAdd` if `id` already carries
    /// one of this kind.
    pub fn add_component<T: 'static>(&mut self, id: EntityId, value: T) -> EngineResult<&'a mut T> {
        let index = self.type_index.index_of::<T>().ok_or(EngineError::UnknownTag)?;
        if self.entities.bitset(id).get(index) {
            return Err(EngineError::DoubleAdd(id));
        }
        unsafe { self.components.add::<T>(index, id, value) };
        self.entities.set_bit(id, index);
        self.refresh.to_rematch.insert(id);
        let value_ref =
            unsafe { self.components.get_mut::<T>(index, id) }.expect("component was just inserted");
        Ok(value_ref)
    }

    /// Remove and return a component. Fails with `DoubleRemove` if `id`
    /// doesn't carry one of this kind.
    pub fn remove_component<T: 'static>(&mut self, id: EntityId) -> EngineResult<T> {
        let index = self.type_index.index_of::<T>().ok_or(EngineError::UnknownTag)?;
        if !self.entities.bitset(id).get(index) {
            return Err(EngineError::DoubleRemove(id));
        }
        let value = unsafe { self.components.remove::<T>(index, id) }
            .ok_or(EngineError::MissingComponent(id))?;
        self.entities.clear_bit(id, index);
        self.refresh.to_rematch.insert(id);
        Ok(value)
    }

    pub fn create_handle(&self, id: EntityId) -> Handle {
        self.entities.make_handle(id)
    }

    pub fn valid_handle(&self, handle: Handle) -> bool {
        self.entities.valid_handle(handle)
    }

    pub fn access(&self, handle: Handle) -> EngineResult<EntityId> {
        if self.entities.valid_handle(handle) {
            Ok(handle.entity_id)
        } else {
            Err(EngineError::InvalidHandle(handle.entity_id, handle.generation))
        }
    }

    /// Run every system with no declared dependencies, and everything
    /// reachable from them.
    pub fn execute_systems(&self) -> EngineResult<()> {
        let roots: Vec<SystemId> = self
            .systems
            .iter()
            .enumerate()
            .filter(|(_, instance)| instance.decl.dependencies.is_empty())
            .map(|(id, _)| id)
            .collect();
        self.execute_systems_from(&roots)
    }

    /// Run the subgraph reachable from `roots`, blocking until it completes.
    pub fn execute_systems_from(&self, roots: &[SystemId]) -> EngineResult<()> {
        self.scheduler.execute_systems_from(
            self.systems,
            self.components,
            self.type_index,
            self.pool,
            self.worker_count,
            self.inner_parallelism_allowed,
            roots,
        )
    }
}

fn unsubscribe_from_kill_list(
    sid: SystemId,
    instance: &SystemInstance,
    ids: &[EntityId],
    handlers: &Mutex<RefreshHandlers>,
) {
    for &id in ids {
        if unsafe { instance.subscribed_mut() }.remove(id) {
            handlers.lock().fire_unsubscribe(sid, id);
        }
    }
}

fn rematch_system(
    sid: SystemId,
    instance: &SystemInstance,
    entities: &EntityTable,
    ids: &[EntityId],
    handlers: &Mutex<RefreshHandlers>,
) {
    let subscribed = unsafe { instance.subscribed_mut() };
    for &id in ids {
        if !entities.alive(id) {
            subscribed.remove(id);
            continue;
        }
        let matches = entities.bitset(id).contains(instance.decl.required);
        if matches {
            if subscribed.insert(id) {
                handlers.lock().fire_subscribe(sid, id);
            }
        } else if subscribed.remove(id) {
            handlers.lock().fire_unsubscribe(sid, id);
        }
    }
}

/// Drives the three refresh passes (R1/R2/R3, C9) that run after a step's
/// system execution and before the engine is handed back to the caller.
pub struct RefreshPipeline;

impl RefreshPipeline {
    /// Runs R1 (sequential deferred-closure execution), R2 (parallel
    /// dead-entity reclamation), and R3 (parallel subscription rematch),
    /// in that order. `state` carries over whatever the step body itself
    /// queued through its own `StepProxy` (creations, component
    /// add/remove) before the step ended — R1's deferred closures append
    /// to the same accumulator rather than starting from empty.
    #[allow(clippy::too_many_arguments)]
    pub fn run(
        systems: &mut [SystemInstance],
        entities: &mut EntityTable,
        components: &ComponentRegistry,
        type_index: &TypeIndex,
        scheduler: &OuterScheduler,
        pool: &ThreadPool,
        worker_count: usize,
        inner_parallelism_allowed: bool,
        handlers: &Mutex<RefreshHandlers>,
        mut state: RefreshState,
    ) {
        Self::run_r1(
            systems,
            entities,
            components,
            type_index,
            scheduler,
            pool,
            worker_count,
            inner_parallelism_allowed,
            handlers,
            &mut state,
        );
        Self::run_r2(systems, entities, pool, handlers, &mut state);
        Self::run_r3(systems, entities, pool, handlers, &mut state);
    }

    /// R1: every closure a system deferred during its run, executed
    /// sequentially against a step-level proxy, in declaration order,
    /// subtask-index order, then push order (spec's deterministic replay
    /// order for R1).
    #[allow(clippy::too_many_arguments)]
    fn run_r1(
        systems: &mut [SystemInstance],
        entities: &mut EntityTable,
        components: &ComponentRegistry,
        type_index: &TypeIndex,
        scheduler: &OuterScheduler,
        pool: &ThreadPool,
        worker_count: usize,
        inner_parallelism_allowed: bool,
        handlers: &Mutex<RefreshHandlers>,
        state: &mut RefreshState,
    ) {
        let mut closures = Vec::new();
        for instance in systems.iter_mut() {
            for subtask in instance.subtask_states.iter_mut() {
                closures.extend(subtask.deferred.drain(..));
            }
        }
        log::trace!("refresh R1: replaying {} deferred closures", closures.len());
        for closure in closures {
            let mut proxy = StepProxy::new(
                &mut *entities,
                components,
                type_index,
                &mut *state,
                &*systems,
                handlers,
                scheduler,
                pool,
                worker_count,
                inner_parallelism_allowed,
            );
            closure(&mut proxy);
        }
        log::debug!("refresh R1 done");
    }

    /// R2: union every subtask's kill set into one list, unsubscribe it
    /// from every system in parallel, then reclaim each id sequentially
    /// (the entity table itself isn't sharded per system, so this last step
    /// can't be split the same way as the unsubscribe pass).
    fn run_r2(
        systems: &mut [SystemInstance],
        entities: &mut EntityTable,
        pool: &ThreadPool,
        handlers: &Mutex<RefreshHandlers>,
        state: &mut RefreshState,
    ) {
        for instance in systems.iter() {
            for subtask in &instance.subtask_states {
                for id in subtask.kill_set.iter() {
                    state.to_kill.insert(id);
                }
            }
        }
        if state.to_kill.is_empty() {
            log::trace!("refresh R2: nothing to reclaim");
            return;
        }

        let ids: Arc<Vec<EntityId>> = Arc::new(state.to_kill.iter().collect());
        log::trace!("refresh R2: reclaiming {} entities across {} systems", ids.len(), systems.len());
        let n = systems.len();
        let latch = Arc::new(CounterLatch::new(n as u32));
        let systems_ptr = RawRef::new(&*systems);
        let handlers_ptr = RawRef::new(handlers);

        for sid in 0..n.saturating_sub(1) {
            let ids = ids.clone();
            let latch_for_job = latch.clone();
            let job: crate::thread_pool::Job = Box::new(move || {
                let systems = unsafe { systems_ptr.get() };
                let handlers = unsafe { handlers_ptr.get() };
                unsubscribe_from_kill_list(sid, &systems[sid], &ids, handlers);
            });
            pool.submit(job, latch_for_job);
        }
        if n > 0 {
            let last = n - 1;
            unsubscribe_from_kill_list(last, &systems[last], &ids, handlers);
            latch.notify();
        }
        latch.wait();

        let mut guard = handlers.lock();
        for &id in ids.iter() {
            entities.reclaim(id);
            guard.fire_reclaim(id);
        }
        state.to_kill.clear();
        log::debug!("refresh R2 done");
    }

    /// R3: for every entity touched since the last refresh, re-test it
    /// against each system's required set in parallel, subscribing or
    /// unsubscribing as needed.
    fn run_r3(
        systems: &mut [SystemInstance],
        entities: &EntityTable,
        pool: &ThreadPool,
        handlers: &Mutex<RefreshHandlers>,
        state: &mut RefreshState,
    ) {
        if state.to_rematch.is_empty() {
            state.to_rematch.clear();
            log::trace!("refresh R3: nothing to rematch");
            return;
        }

        let ids: Arc<Vec<EntityId>> = Arc::new(state.to_rematch.iter().collect());
        log::trace!("refresh R3: rematching {} entities across {} systems", ids.len(), systems.len());
        let n = systems.len();
        let latch = Arc::new(CounterLatch::new(n as u32));
        let systems_ptr = RawRef::new(&*systems);
        let entities_ptr = RawRef::new(entities);
        let handlers_ptr = RawRef::new(handlers);

        for sid in 0..n.saturating_sub(1) {
            let ids = ids.clone();
            let latch_for_job = latch.clone();
            let job: crate::thread_pool::Job = Box::new(move || {
                let systems = unsafe { systems_ptr.get() };
                let entities = unsafe { entities_ptr.get() };
                let handlers = unsafe { handlers_ptr.get() };
                rematch_system(sid, &systems[sid], entities, &ids, handlers);
            });
            pool.submit(job, latch_for_job);
        }
        if n > 0 {
            let last = n - 1;
            rematch_system(last, &systems[last], entities, &ids, handlers);
            latch.notify();
        }
        latch.wait();

        state.to_rematch.clear();
        log::debug!("refresh R3 done");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitset::ComponentBitset;
    use crate::component::StorageStrategy;
    use crate::entity::CapacityMode;
    use crate::system::{DataProxy, SystemDecl, SystemLogic};
    use std::any::Any;

    struct Noop;
    impl SystemLogic for Noop {
        fn run(&self, _proxy: &mut DataProxy) {}
        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    fn make_type_index_and_components() -> (TypeIndex, ComponentRegistry) {
        let mut type_index = TypeIndex::new();
        let mut components = ComponentRegistry::new();
        let idx = type_index.register::<u32>();
        components.register::<u32>(idx, StorageStrategy::Dense);
        (type_index, components)
    }

    #[test]
    fn step_proxy_add_remove_component_updates_bitset_and_queues_rematch() {
        let (type_index, components) = make_type_index_and_components();
        let mut entities = EntityTable::new(CapacityMode::Dynamic { hint: 4 });
        let mut state = RefreshState::new();
        let systems: Vec<SystemInstance> = Vec::new();
        let handlers = Mutex::new(RefreshHandlers::new());
        let scheduler = OuterScheduler::new(&[]).unwrap();
        let pool = ThreadPool::with_workers(1);

        let id = entities.create().unwrap();
        let mut proxy = StepProxy::new(
            &mut entities,
            &components,
            &type_index,
            &mut state,
            &systems,
            &handlers,
            &scheduler,
            &pool,
            1,
            true,
        );
        let index = type_index.index_of::<u32>().unwrap();
        *proxy.add_component::<u32>(id, 7).unwrap() = 9;
        assert!(proxy.entities.bitset(id).get(index));
        assert_eq!(proxy.remove_component::<u32>(id).unwrap(), 9);
        assert!(!proxy.entities.bitset(id).get(index));
        assert!(state.to_rematch.contains(id));
    }

    #[test]
    fn step_proxy_kill_entity_unsubscribes_and_reclaims_immediately() {
        let (type_index, components) = make_type_index_and_components();
        let mut entities = EntityTable::new(CapacityMode::Dynamic { hint: 4 });
        let id = entities.create().unwrap();

        let decl = SystemDecl::new(0, ComponentBitset::empty(), ComponentBitset::empty());
        let mut instance = SystemInstance::new(decl, Box::new(Noop));
        instance.subscribed.insert(id);
        let systems = vec![instance];

        let mut state = RefreshState::new();
        let handlers = Mutex::new(RefreshHandlers::new());
        let scheduler = OuterScheduler::new(&[]).unwrap();
        let pool = ThreadPool::with_workers(1);

        let mut proxy = StepProxy::new(
            &mut entities,
            &components,
            &type_index,
            &mut state,
            &systems,
            &handlers,
            &scheduler,
            &pool,
            1,
            true,
        );
        proxy.kill_entity(id);
        assert!(!systems[0].subscribed.contains(id));
        assert!(!entities.alive(id));
    }

    #[test]
    fn refresh_pipeline_reclaims_and_rematches() {
        let (type_index, components) = make_type_index_and_components();
        let mut entities = EntityTable::new(CapacityMode::Dynamic { hint: 4 });
        let kept = entities.create().unwrap();
        let killed = entities.create().unwrap();

        let required = ComponentBitset::with_bit(type_index.index_of::<u32>().unwrap());
        let decl = SystemDecl::new(0, required, ComponentBitset::empty());
        let mut instance = SystemInstance::new(decl, Box::new(Noop));
        instance.prepare_subtask_states(1);
        unsafe {
            instance.subtask_state_mut(0).kill_set.insert(killed);
        }
        let mut systems = vec![instance];

        entities.set_bit(kept, type_index.index_of::<u32>().unwrap());
        let mut state = RefreshState::new();
        state.to_rematch.insert(kept);
        state.to_rematch.insert(killed);

        let handlers = Mutex::new(RefreshHandlers::new());
        let pool = ThreadPool::with_workers(2);

        RefreshPipeline::run_r2(&mut systems, &mut entities, &pool, &handlers, &mut state);
        assert!(!entities.alive(killed));

        RefreshPipeline::run_r3(&mut systems, &entities, &pool, &handlers, &mut state);
        assert!(systems[0].subscribed.contains(kept));
        assert!(!systems[0].subscribed.contains(killed));
    }
}
