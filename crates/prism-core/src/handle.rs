//! Generation-tagged resource handles.
//!
//! CPU-side ownership says nothing about whether the GPU still reads a
//! resource, so handles never keep a resource alive. Every handle carries the
//! generation of the slot it was issued from; destroying the resource bumps
//! the slot generation and any copy of the old handle is rejected afterwards.

use crate::error::{Error, Result};

/// Fence value signalled by the frame-fence collaborator when a submission completes.
pub type FenceValue = u64;

/// A handle made of a slot index and the slot generation it was issued from.
pub trait SlotHandle: Copy + Eq + std::fmt::Debug {
    /// Build a handle from its raw parts.
    fn from_parts(index: u32, generation: u32) -> Self;
    /// Slot index.
    fn index(&self) -> u32;
    /// Slot generation at issue time.
    fn generation(&self) -> u32;
}

macro_rules! slot_handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
        pub struct $name {
            index: u32,
            generation: u32,
        }

        impl SlotHandle for $name {
            #[inline]
            fn from_parts(index: u32, generation: u32) -> Self {
                Self { index, generation }
            }

            #[inline]
            fn index(&self) -> u32 {
                self.index
            }

            #[inline]
            fn generation(&self) -> u32 {
                self.generation
            }
        }
    };
}

slot_handle!(
    /// Handle to a device buffer.
    BufferHandle
);
slot_handle!(
    /// Handle to a ray tracing pipeline state object.
    PipelineHandle
);

struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

/// Slot storage issuing generation-tagged handles.
///
/// Backends keep their per-resource state here so that stale handles are
/// detected instead of aliasing a newer resource in a reused slot.
pub struct Registry<H, T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    live: usize,
    _handle: std::marker::PhantomData<H>,
}

impl<H: SlotHandle, T> Registry<H, T> {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            live: 0,
            _handle: std::marker::PhantomData,
        }
    }

    /// Store a value and issue a handle for it.
    pub fn insert(&mut self, value: T) -> H {
        self.live += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.value = Some(value);
            return H::from_parts(index, slot.generation);
        }

        let index = u32::try_from(self.slots.len()).unwrap_or(u32::MAX);
        self.slots.push(Slot {
            generation: 0,
            value: Some(value),
        });
        H::from_parts(index, 0)
    }

    /// Look up a live value.
    pub fn get(&self, handle: H) -> Result<&T> {
        self.slots
            .get(handle.index() as usize)
            .filter(|slot| slot.generation == handle.generation())
            .and_then(|slot| slot.value.as_ref())
            .ok_or_else(|| Error::StaleHandle(format!("{handle:?}")))
    }

    /// Look up a live value mutably.
    pub fn get_mut(&mut self, handle: H) -> Result<&mut T> {
        self.slots
            .get_mut(handle.index() as usize)
            .filter(|slot| slot.generation == handle.generation())
            .and_then(|slot| slot.value.as_mut())
            .ok_or_else(|| Error::StaleHandle(format!("{handle:?}")))
    }

    /// Remove a value, invalidating every copy of its handle.
    pub fn remove(&mut self, handle: H) -> Result<T> {
        let slot = self
            .slots
            .get_mut(handle.index() as usize)
            .filter(|slot| slot.generation == handle.generation() && slot.value.is_some())
            .ok_or_else(|| Error::StaleHandle(format!("{handle:?}")))?;

        let value = slot.value.take();
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index());
        self.live -= 1;
        value.ok_or_else(|| Error::StaleHandle(format!("{handle:?}")))
    }

    /// Whether the handle refers to a live value.
    pub fn contains(&self, handle: H) -> bool {
        self.get(handle).is_ok()
    }

    /// Number of live values.
    pub fn len(&self) -> usize {
        self.live
    }

    /// Whether no values are live.
    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Iterate over live handles and values.
    pub fn iter(&self) -> impl Iterator<Item = (H, &T)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.value
                .as_ref()
                .map(|value| (H::from_parts(index as u32, slot.generation), value))
        })
    }

    /// Remove every live value, returning them.
    pub fn drain(&mut self) -> Vec<T> {
        let mut values = Vec::with_capacity(self.live);
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if let Some(value) = slot.value.take() {
                slot.generation = slot.generation.wrapping_add(1);
                self.free.push(index as u32);
                values.push(value);
            }
        }
        self.live = 0;
        values
    }
}

impl<H: SlotHandle, T> Default for Registry<H, T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_and_get() {
        let mut registry: Registry<BufferHandle, &str> = Registry::new();
        let a = registry.insert("a");
        let b = registry.insert("b");

        assert_ne!(a, b);
        assert_eq!(*registry.get(a).unwrap(), "a");
        assert_eq!(*registry.get(b).unwrap(), "b");
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn removed_handle_is_stale() {
        let mut registry: Registry<BufferHandle, u32> = Registry::new();
        let handle = registry.insert(7);
        assert_eq!(registry.remove(handle).unwrap(), 7);

        assert!(matches!(registry.get(handle), Err(Error::StaleHandle(_))));
        assert!(matches!(registry.remove(handle), Err(Error::StaleHandle(_))));
        assert!(registry.is_empty());
    }

    #[test]
    fn reused_slot_rejects_old_generation() {
        let mut registry: Registry<PipelineHandle, u32> = Registry::new();
        let old = registry.insert(1);
        registry.remove(old).unwrap();
        let new = registry.insert(2);

        assert_eq!(old.index(), new.index());
        assert_ne!(old.generation(), new.generation());
        assert!(!registry.contains(old));
        assert_eq!(*registry.get(new).unwrap(), 2);
    }

    #[test]
    fn drain_invalidates_everything() {
        let mut registry: Registry<BufferHandle, u32> = Registry::new();
        let handles: Vec<_> = (0..4).map(|i| registry.insert(i)).collect();

        let mut drained = registry.drain();
        drained.sort_unstable();
        assert_eq!(drained, vec![0, 1, 2, 3]);
        assert!(registry.is_empty());
        assert!(handles.iter().all(|h| !registry.contains(*h)));
    }
}
