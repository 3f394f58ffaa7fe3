use thiserror::Error;

use crate::entity::EntityId;

/// Every failure mode the engine can surface, per the propagation policy:
/// all errors reach the caller at the nearest step-call boundary.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("cyclic dependency detected among declared systems")]
    CyclicDependency,
    #[error("systems {0} and {1} have no dependency path between them but conflict on a component kind")]
    ConflictingSystems(usize, usize),
    #[error("dependency, read, or write list referenced an unregistered component or system")]
    UnknownTag,
    #[error("entity table is at fixed capacity, can't create a new entity")]
    CapacityExhausted,
    #[error("handle ({0}, generation {1}) no longer resolves to a live entity")]
    InvalidHandle(EntityId, u64),
    #[error("a user system closure panicked: {0}")]
    UserError(String),
    #[error("entity {0} already has a component of this kind")]
    DoubleAdd(EntityId),
    #[error("entity {0} doesn't have a component of this kind to remove")]
    DoubleRemove(EntityId),
    #[error("entity {0} is missing a required component")]
    MissingComponent(EntityId),
}

pub type EngineResult<T> = Result<T, EngineError>;
