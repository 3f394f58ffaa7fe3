use crate::bitset::ComponentBitset;
use crate::error::EngineError;
use crate::sparse_set::SparseSet;

/// A dense, non-negative entity index drawn from `[0, capacity)`.
pub type EntityId = u32;

/// Sits outside the valid `[0, capacity)` range; never returned by
/// `EntityTable::create`.
pub const INVALID_ENTITY: EntityId = EntityId::MAX;

/// An opaque `(entity_id, generation)` pair. Valid iff `entity_id !=
/// INVALID_ENTITY` and the entity table's current generation at that id
/// equals the handle's generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle {
    pub entity_id: EntityId,
    pub generation: u64,
}

impl Handle {
    pub const INVALID: Handle = Handle {
        entity_id: INVALID_ENTITY,
        generation: 0,
    };
}

#[derive(Debug, Clone, Copy, Default)]
struct EntityMeta {
    bitset: ComponentBitset,
    generation: u64,
    alive: bool,
}

/// Whether the entity table may grow past its initial hint.
#[derive(Debug, Clone, Copy)]
pub enum CapacityMode {
    Fixed(usize),
    Dynamic { hint: usize },
}

/// Entity ids, per-entity component bitsets, generation counters, and the
/// free-id list (C3).
pub struct EntityTable {
    metadata: Vec<EntityMeta>,
    free_ids: SparseSet,
    mode: CapacityMode,
    alive_count: usize,
}

impl EntityTable {
    pub fn new(mode: CapacityMode) -> Self {
        let hint = match mode {
            CapacityMode::Fixed(n) => n,
            CapacityMode::Dynamic { hint } => hint,
        };
        let mut table = Self {
            metadata: Vec::with_capacity(hint),
            free_ids: SparseSet::new(),
            mode,
            alive_count: 0,
        };
        table.grow_to(hint);
        table
    }

    fn grow_to(&mut self, new_len: usize) {
        let start = self.metadata.len();
        if new_len <= start {
            return;
        }
        log::debug!("entity table growing from {start} to {new_len}");
        self.metadata.resize(new_len, EntityMeta::default());
        self.free_ids.ensure_universe(new_len);
        for id in start..new_len {
            self.free_ids.insert(id as EntityId);
        }
    }

    pub fn capacity(&self) -> usize {
        self.metadata.len()
    }

    pub fn alive_count(&self) -> usize {
        self.alive_count
    }

    /// Pop a free id, growing the table first in dynamic mode if none are
    /// available. Fails with `CapacityExhausted` in fixed mode.
    pub fn create(&mut self) -> Result<EntityId, EngineError> {
        if self.free_ids.is_empty() {
            match self.mode {
                CapacityMode::Fixed(_) => return Err(EngineError::CapacityExhausted),
                CapacityMode::Dynamic { .. } => {
                    let new_len = (self.metadata.len().max(1)) * 2;
                    log::trace!("entity table exhausted free list, doubling capacity to {new_len}");
                    self.grow_to(new_len);
                }
            }
        }
        let id = self.free_ids.pop().expect("grew the table but still empty");
        let meta = &mut self.metadata[id as usize];
        meta.alive = true;
        meta.bitset = ComponentBitset::empty();
        self.alive_count += 1;
        Ok(id)
    }

    /// Push `id` back onto the free list, bump its generation, and clear
    /// its bitset. Idempotent if `id` is already free.
    pub fn reclaim(&mut self, id: EntityId) {
        let meta = &mut self.metadata[id as usize];
        if !meta.alive {
            return;
        }
        meta.alive = false;
        meta.bitset = ComponentBitset::empty();
        meta.generation = meta.generation.wrapping_add(1);
        self.free_ids.insert(id);
        self.alive_count -= 1;
    }

    pub fn alive(&self, id: EntityId) -> bool {
        id != INVALID_ENTITY
            && (id as usize) < self.metadata.len()
            && self.metadata[id as usize].alive
    }

    pub fn bitset(&self, id: EntityId) -> ComponentBitset {
        self.metadata[id as usize].bitset
    }

    pub fn set_bit(&mut self, id: EntityId, index: usize) {
        self.metadata[id as usize].bitset.set(index);
    }

    pub fn clear_bit(&mut self, id: EntityId, index: usize) {
        self.metadata[id as usize].bitset.clear(index);
    }

    pub fn generation(&self, id: EntityId) -> u64 {
        self.metadata[id as usize].generation
    }

    pub fn make_handle(&self, id: EntityId) -> Handle {
        Handle {
            entity_id: id,
            generation: self.generation(id),
        }
    }

    pub fn valid_handle(&self, handle: Handle) -> bool {
        handle.entity_id != INVALID_ENTITY
            && self.alive(handle.entity_id)
            && self.generation(handle.entity_id) == handle.generation
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_and_reclaim_bumps_generation() {
        let mut table = EntityTable::new(CapacityMode::Dynamic { hint: 4 });
        let e = table.create().unwrap();
        let h = table.make_handle(e);
        assert!(table.valid_handle(h));
        table.reclaim(e);
        assert!(!table.valid_handle(h));
        assert!(!table.alive(e));
    }

    #[test]
    fn fixed_capacity_exhausted() {
        let mut table = EntityTable::new(CapacityMode::Fixed(1));
        let e = table.create().unwrap();
        assert!(matches!(table.create(), Err(EngineError::CapacityExhausted)));
        table.reclaim(e);
        assert!(table.create().is_ok());
    }

    #[test]
    fn dynamic_grows_past_hint() {
        let mut table = EntityTable::new(CapacityMode::Dynamic { hint: 1 });
        let ids: Vec<_> = (0..8).map(|_| table.create().unwrap()).collect();
        assert_eq!(ids.len(), 8);
        assert!(table.capacity() >= 8);
    }

    #[test]
    fn reused_id_invalidates_old_handle() {
        let mut table = EntityTable::new(CapacityMode::Fixed(1));
        let e1 = table.create().unwrap();
        let h1 = table.make_handle(e1);
        table.reclaim(e1);
        let e2 = table.create().unwrap();
        assert_eq!(e1, e2);
        assert!(!table.valid_handle(h1));
        assert!(table.valid_handle(table.make_handle(e2)));
    }
}
