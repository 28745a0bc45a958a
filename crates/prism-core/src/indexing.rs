//! Hit-group indexing shared by instance numbering and SBT layout.
//!
//! At dispatch the hardware selects a hit record as
//! `ray_type + instance_contribution` (every BLAS here carries its geometry
//! as one logical mesh, so the per-geometry multiplier term is always zero).
//! The TLAS builder writes `instance_contribution` into each instance
//! descriptor and the SBT builder places records using [`HitGroupIndexing::hit_slots`];
//! both go through this type so the two can never disagree.

use crate::constants::MAX_INSTANCE_FIELD;
use crate::error::{Error, Result};
use crate::geometry::Instance;

/// Indexing convention for a fixed number of ray types.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct HitGroupIndexing {
    ray_type_count: u32,
}

/// One slot of the hit region, in write order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct HitSlot {
    /// Record index within the hit region.
    pub record_index: u32,
    /// Position of the instance in the instance list.
    pub instance_index: u32,
    pub ray_type: u32,
    /// Hit binding of that instance.
    pub hit_binding: u32,
}

impl HitGroupIndexing {
    pub fn new(ray_type_count: u32) -> Result<Self> {
        if ray_type_count == 0 {
            return Err(Error::InvalidInput(
                "ray type count must be at least 1".to_string(),
            ));
        }
        Ok(Self { ray_type_count })
    }

    pub const fn ray_type_count(&self) -> u32 {
        self.ray_type_count
    }

    /// Contribution written into the instance descriptor at `instance_index`.
    pub fn instance_contribution(&self, instance_index: u32) -> Result<u32> {
        instance_index
            .checked_mul(self.ray_type_count)
            .filter(|contribution| {
                contribution
                    .checked_add(self.ray_type_count - 1)
                    .is_some_and(|last| last <= MAX_INSTANCE_FIELD)
            })
            .ok_or_else(|| {
                Error::InvalidInput(format!(
                    "instance {instance_index} exceeds the 24-bit hit-group contribution range"
                ))
            })
    }

    /// Hit region record used when a ray of `ray_type` hits instance `instance_index`.
    pub fn record_index(&self, instance_index: u32, ray_type: u32) -> Result<u32> {
        if ray_type >= self.ray_type_count {
            return Err(Error::InvalidInput(format!(
                "ray type {ray_type} out of range (count {})",
                self.ray_type_count
            )));
        }
        Ok(self.instance_contribution(instance_index)? + ray_type)
    }

    /// Number of hit records needed for `instance_count` instances.
    pub fn hit_record_count(&self, instance_count: usize) -> Result<u32> {
        u32::try_from(instance_count)
            .ok()
            .and_then(|count| count.checked_mul(self.ray_type_count))
            .ok_or_else(|| {
                Error::InvalidInput(format!("{instance_count} instances overflow the hit region"))
            })
    }

    /// Hit region slots in record order.
    pub fn hit_slots(&self, instances: &[Instance]) -> Result<Vec<HitSlot>> {
        let mut slots = Vec::with_capacity(self.hit_record_count(instances.len())? as usize);
        for (instance_index, instance) in instances.iter().enumerate() {
            let instance_index = u32::try_from(instance_index)
                .map_err(|_| Error::InvalidInput("too many instances".to_string()))?;
            for ray_type in 0..self.ray_type_count {
                slots.push(HitSlot {
                    record_index: self.record_index(instance_index, ray_type)?,
                    instance_index,
                    ray_type,
                    hit_binding: instance.hit_binding,
                });
            }
        }
        Ok(slots)
    }
}
