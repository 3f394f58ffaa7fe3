use std::any::TypeId;

use crate::bitset::{ComponentBitset, TypeIndex};
use crate::component::{ComponentRegistry, StorageStrategy};
use crate::engine::Engine;
use crate::entity::{CapacityMode, EntityTable};
use crate::error::{EngineError, EngineResult};
use crate::scheduler::OuterScheduler;
use crate::system::{InnerParallelism, SystemDecl, SystemId, SystemInstance, SystemLogic};
use crate::thread_pool::ThreadPool;

/// Fluent declaration of one system ahead of `EngineBuilder::add_system`.
/// Consumed by value, the way the teacher's `Scheduler::then` chain
/// consumes its builder between calls.
pub struct SystemBuilder {
    logic: Box<dyn SystemLogic>,
    reads: Vec<TypeId>,
    writes: Vec<TypeId>,
    dependencies: Vec<SystemId>,
    inner_parallelism: InnerParallelism,
}

impl SystemBuilder {
    pub fn new(logic: impl SystemLogic + 'static) -> Self {
        Self {
            logic: Box::new(logic),
            reads: Vec::new(),
            writes: Vec::new(),
            dependencies: Vec::new(),
            inner_parallelism: InnerParallelism::None,
        }
    }

    pub fn reads<T: 'static>(mut self) -> Self {
        self.reads.push(TypeId::of::<T>());
        self
    }

    pub fn writes<T: 'static>(mut self) -> Self {
        self.writes.push(TypeId::of::<T>());
        self
    }

    /// Declare that this system must run after `id`. `id` must already
    /// have been returned by an earlier `EngineBuilder::add_system` call.
    pub fn depends_on(mut self, id: SystemId) -> Self {
        self.dependencies.push(id);
        self
    }

    pub fn inner_parallelism(mut self, policy: InnerParallelism) -> Self {
        self.inner_parallelism = policy;
        self
    }
}

/// The configuration front-end: register component kinds, declare systems,
/// set capacity and worker-count policy, then `build()` into a running
/// `Engine`. Config setters follow the teacher's `&mut self -> &mut Self`
/// shape; `add_system` returns the freshly assigned id immediately since
/// later systems need it for `depends_on`, unlike the teacher's own
/// auto-detected dependency graph.
pub struct EngineBuilder {
    type_index: TypeIndex,
    components: ComponentRegistry,
    pending: Vec<SystemBuilder>,
    capacity_mode: CapacityMode,
    worker_count: Option<usize>,
    inner_parallelism_allowed: bool,
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self {
            type_index: TypeIndex::new(),
            components: ComponentRegistry::new(),
            pending: Vec::new(),
            capacity_mode: CapacityMode::Dynamic { hint: 1024 },
            worker_count: None,
            inner_parallelism_allowed: true,
        }
    }

    /// Register a component kind and the storage strategy it uses. Kinds
    /// must be registered before any system referencing them via
    /// `reads`/`writes` is added.
    pub fn component<T: 'static + Send + Sync>(&mut self, strategy: StorageStrategy) -> &mut Self {
        let index = self.type_index.register::<T>();
        self.components.register::<T>(index, strategy);
        self
    }

    pub fn capacity_mode(&mut self, mode: CapacityMode) -> &mut Self {
        self.capacity_mode = mode;
        self
    }

    pub fn worker_count(&mut self, count: usize) -> &mut Self {
        self.worker_count = Some(count);
        self
    }

    pub fn inner_parallelism_allowed(&mut self, allowed: bool) -> &mut Self {
        self.inner_parallelism_allowed = allowed;
        self
    }

    /// Queue a system declaration, returning the id it will be assigned.
    pub fn add_system(&mut self, builder: SystemBuilder) -> SystemId {
        let id = self.pending.len();
        self.pending.push(builder);
        id
    }

    fn resolve_bitset(type_index: &TypeIndex, kinds: &[TypeId]) -> EngineResult<ComponentBitset> {
        let mut bitset = ComponentBitset::empty();
        for &kind in kinds {
            let index = type_index.index_of_type(kind).ok_or(EngineError::UnknownTag)?;
            bitset.set(index);
        }
        Ok(bitset)
    }

    /// Validate and assemble everything queued so far into a running
    /// `Engine`: resolve every system's declared types into bitsets, build
    /// the DAG (cycle + static non-conflict check, P4), and size the
    /// thread pool to `worker_count` or the host's core count.
    pub fn build(&mut self) -> EngineResult<Engine> {
        let type_index = std::mem::take(&mut self.type_index);
        let components = std::mem::take(&mut self.components);
        let pending = std::mem::take(&mut self.pending);

        let mut decls = Vec::with_capacity(pending.len());
        let mut instances = Vec::with_capacity(pending.len());
        for (id, builder) in pending.into_iter().enumerate() {
            let reads = Self::resolve_bitset(&type_index, &builder.reads)?;
            let writes = Self::resolve_bitset(&type_index, &builder.writes)?;
            let mut decl = SystemDecl::new(id, reads, writes);
            decl.dependencies = builder.dependencies;
            decl.inner_parallelism = builder.inner_parallelism;
            decls.push(SystemDecl {
                id: decl.id,
                reads: decl.reads,
                writes: decl.writes,
                required: decl.required,
                dependencies: decl.dependencies.clone(),
                inner_parallelism: decl.inner_parallelism.clone(),
            });
            instances.push(SystemInstance::new(decl, builder.logic));
        }

        let scheduler = OuterScheduler::new(&decls)?;
        let worker_count = self
            .worker_count
            .unwrap_or_else(|| std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1));
        let pool = ThreadPool::with_workers(worker_count);
        let entities = EntityTable::new(self.capacity_mode);

        Ok(Engine::from_parts(
            entities,
            components,
            type_index,
            instances,
            scheduler,
            pool,
            worker_count,
            self.inner_parallelism_allowed,
        ))
    }
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}
