//! Fixed-capacity slot arena shared by the handler and task tables.

/// Identifies one live entry: the slot index plus the generation of the
/// registration occupying it. A freed slot bumps its generation, so a stale
/// id never aliases a newer entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct SlotId {
    pub(crate) index: usize,
    pub(crate) generation: u32,
}

#[derive(Debug)]
struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

/// Arena with first-free-slot allocation. Never grows past its capacity.
#[derive(Debug)]
pub(crate) struct Slots<T> {
    entries: Vec<Slot<T>>,
}

impl<T> Slots<T> {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        let entries = (0..capacity)
            .map(|_| Slot {
                generation: 0,
                value: None,
            })
            .collect();
        Self { entries }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.iter().filter(|s| s.value.is_some()).count()
    }

    /// Store `value` in the first free slot, or hand it back if full.
    pub(crate) fn insert(&mut self, value: T) -> Result<SlotId, T> {
        match self.entries.iter().position(|s| s.value.is_none()) {
            Some(index) => {
                let slot = &mut self.entries[index];
                slot.value = Some(value);
                Ok(SlotId {
                    index,
                    generation: slot.generation,
                })
            }
            None => Err(value),
        }
    }

    pub(crate) fn remove(&mut self, id: SlotId) -> Option<T> {
        let slot = self.entries.get_mut(id.index)?;
        if slot.generation != id.generation || slot.value.is_none() {
            return None;
        }
        slot.generation = slot.generation.wrapping_add(1);
        slot.value.take()
    }

    pub(crate) fn get(&self, id: SlotId) -> Option<&T> {
        self.entries
            .get(id.index)
            .filter(|s| s.generation == id.generation)
            .and_then(|s| s.value.as_ref())
    }

    pub(crate) fn get_mut(&mut self, id: SlotId) -> Option<&mut T> {
        self.entries
            .get_mut(id.index)
            .filter(|s| s.generation == id.generation)
            .and_then(|s| s.value.as_mut())
    }

    /// Id of the live entry at `index`, if any.
    pub(crate) fn id_at(&self, index: usize) -> Option<SlotId> {
        let slot = self.entries.get(index)?;
        slot.value.as_ref().map(|_| SlotId {
            index,
            generation: slot.generation,
        })
    }

    /// Live entries in slot order.
    pub(crate) fn iter(&self) -> impl Iterator<Item = (SlotId, &T)> {
        self.entries.iter().enumerate().filter_map(|(index, slot)| {
            slot.value.as_ref().map(|value| {
                (
                    SlotId {
                        index,
                        generation: slot.generation,
                    },
                    value,
                )
            })
        })
    }

    /// Free every slot, returning how many were live.
    pub(crate) fn clear(&mut self) -> usize {
        let mut cleared = 0;
        for slot in &mut self.entries {
            if slot.value.take().is_some() {
                slot.generation = slot.generation.wrapping_add(1);
                cleared += 1;
            }
        }
        cleared
    }
}
