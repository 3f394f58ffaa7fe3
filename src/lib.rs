//! A statically configured, automatically parallelized entity-component-
//! system runtime.
//!
//! A declaration (component kinds, systems and their dependencies) is
//! assembled once via [`EngineBuilder`] and validated at [`build`] time
//! (acyclic dependency graph, no two unrelated systems conflict on a
//! component kind). The resulting [`Engine`] drives steps: a user-supplied
//! body mutates entities through a [`StepProxy`], typically dispatching the
//! system DAG via `execute_systems`/`execute_systems_from`, after which the
//! refresh pipeline reclaims killed entities and re-matches every changed
//! one against every system's subscription set.
//!
//! [`build`]: EngineBuilder::build

mod bitset;
mod builder;
mod component;
mod engine;
mod entity;
mod error;
mod inner_executor;
mod latch;
mod raw_ptr;
mod refresh;
mod scheduler;
mod sparse_set;
mod system;
mod thread_pool;

pub use bitset::{ComponentBitset, TypeIndex};
pub use builder::{EngineBuilder, SystemBuilder};
pub use component::{ComponentRegistry, ComponentStore, DenseStore, MapStore, StorageStrategy};
pub use engine::Engine;
pub use entity::{CapacityMode, EntityId, EntityTable, Handle, INVALID_ENTITY};
pub use error::{EngineError, EngineResult};
pub use latch::CounterLatch;
pub use refresh::{RefreshHandlers, RefreshState, StepProxy};
pub use system::{
    DataProxy, DeferredClosure, InnerParallelism, SubtaskState, SystemDecl, SystemId,
    SystemInstance, SystemLogic,
};
pub use thread_pool::{Job, ThreadPool};
