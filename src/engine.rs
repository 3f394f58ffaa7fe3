use parking_lot::Mutex;

use crate::bitset::TypeIndex;
use crate::component::ComponentRegistry;
use crate::entity::EntityTable;
use crate::error::EngineResult;
use crate::refresh::{RefreshHandlers, RefreshPipeline, RefreshState, StepProxy};
use crate::scheduler::OuterScheduler;
use crate::system::SystemInstance;
use crate::thread_pool::ThreadPool;

/// The running engine: entity table, component storage, and the static
/// system DAG, all owned directly rather than split across a separate
/// `World`/`Executor` pair — the refresh pipeline ties entities,
/// components, and subscriptions together closely enough that a
/// query-time join between a world and an executor has no role here.
pub struct Engine {
    entities: EntityTable,
    components: ComponentRegistry,
    type_index: TypeIndex,
    systems: Vec<SystemInstance>,
    scheduler: OuterScheduler,
    pool: ThreadPool,
    worker_count: usize,
    inner_parallelism_allowed: bool,
}

impl Engine {
    /// Start building a declaration via the fluent configuration
    /// front-end.
    pub fn builder() -> crate::builder::EngineBuilder {
        crate::builder::EngineBuilder::new()
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn from_parts(
        entities: EntityTable,
        components: ComponentRegistry,
        type_index: TypeIndex,
        systems: Vec<SystemInstance>,
        scheduler: OuterScheduler,
        pool: ThreadPool,
        worker_count: usize,
        inner_parallelism_allowed: bool,
    ) -> Self {
        Self {
            entities,
            components,
            type_index,
            systems,
            scheduler,
            pool,
            worker_count,
            inner_parallelism_allowed,
        }
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    pub fn entity_capacity(&self) -> usize {
        self.entities.capacity()
    }

    pub fn alive_count(&self) -> usize {
        self.entities.alive_count()
    }

    pub fn system_count(&self) -> usize {
        self.systems.len()
    }

    /// Open one step: `body` runs against a step-level proxy (it typically
    /// calls `execute_systems` or `execute_systems_from` somewhere inside,
    /// though nothing requires it to); once `body` returns, the refresh
    /// pipeline (R1-R3) runs unconditionally, invoking `handlers` for any
    /// subscription changes it makes. Whatever `body` returned — `Ok` or
    /// the first error it chose to propagate — is returned here, after
    /// refresh has already restored the engine's invariants (§4.8/§7: a
    /// failed step still refreshes, so the engine is always left
    /// consistent for the next one).
    pub fn step<F>(&mut self, body: F, handlers: RefreshHandlers) -> EngineResult<()>
    where
        F: FnOnce(&mut StepProxy) -> EngineResult<()>,
    {
        let handlers = Mutex::new(handlers);
        let mut state = RefreshState::new();
        let result = {
            let mut proxy = StepProxy::new(
                &mut self.entities,
                &self.components,
                &self.type_index,
                &mut state,
                &self.systems,
                &handlers,
                &self.scheduler,
                &self.pool,
                self.worker_count,
                self.inner_parallelism_allowed,
            );
            body(&mut proxy)
        };

        RefreshPipeline::run(
            &mut self.systems,
            &mut self.entities,
            &self.components,
            &self.type_index,
            &self.scheduler,
            &self.pool,
            self.worker_count,
            self.inner_parallelism_allowed,
            &handlers,
            state,
        );

        result
    }
}
