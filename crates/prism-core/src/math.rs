//! Math helpers and the hardware instance record.

use glam::{Mat4, Vec3, Vec4};

use crate::constants::{INSTANCE_MASK_ALL, MAX_INSTANCE_FIELD};

/// Ray for verification traces.
#[derive(Clone, Copy, Debug)]
pub struct Ray {
    /// Ray origin
    pub origin: Vec3,
    /// Ray direction (not required to be normalized)
    pub direction: Vec3,
}

impl Ray {
    /// Create a new ray
    #[inline]
    pub fn new(origin: Vec3, direction: Vec3) -> Self {
        Self { origin, direction }
    }

    /// Get a point along the ray at parameter t
    #[inline]
    pub fn at(&self, t: f32) -> Vec3 {
        self.origin + self.direction * t
    }

    /// Transform ray by a matrix, keeping the parameterization.
    ///
    /// The direction is not renormalized, so `t` measured in the transformed
    /// space matches `t` in the original space.
    #[inline]
    pub fn transform(&self, matrix: Mat4) -> Self {
        Self {
            origin: matrix.transform_point3(self.origin),
            direction: matrix.transform_vector3(self.direction),
        }
    }

    /// Möller-Trumbore intersection. Returns `t` for hits with `t > t_min`.
    pub fn intersect_triangle(&self, v0: Vec3, v1: Vec3, v2: Vec3, t_min: f32) -> Option<f32> {
        let edge1 = v1 - v0;
        let edge2 = v2 - v0;
        let p = self.direction.cross(edge2);
        let det = edge1.dot(p);
        if det.abs() < f32::EPSILON {
            return None;
        }

        let inv_det = det.recip();
        let s = self.origin - v0;
        let u = s.dot(p) * inv_det;
        if !(0.0..=1.0).contains(&u) {
            return None;
        }

        let q = s.cross(edge1);
        let v = self.direction.dot(q) * inv_det;
        if v < 0.0 || u + v > 1.0 {
            return None;
        }

        let t = edge2.dot(q) * inv_det;
        (t > t_min).then_some(t)
    }
}

/// One instance record as consumed by the TLAS build (64 bytes).
///
/// Layout matches both `D3D12_RAYTRACING_INSTANCE_DESC` and
/// `VkAccelerationStructureInstanceKHR`: a row-major 3x4 object-to-world
/// matrix, then two packed 24/8-bit words, then the BLAS GPU address.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct InstanceDescriptor {
    /// Row-major 3x4 transform.
    pub transform: [f32; 12],
    /// Bits 0..24: instance id, bits 24..32: visibility mask.
    pub instance_id_and_mask: u32,
    /// Bits 0..24: hit-group contribution, bits 24..32: instance flags.
    pub contribution_and_flags: u32,
    /// GPU address of the referenced BLAS.
    pub blas_address: u64,
}

impl InstanceDescriptor {
    /// Build a record visible to every ray, with no instance flags.
    ///
    /// `instance_id` and `contribution` are truncated to 24 bits; callers
    /// check the range beforehand.
    pub fn new(transform: &Mat4, instance_id: u32, contribution: u32, blas_address: u64) -> Self {
        Self {
            transform: row_major_3x4(transform),
            instance_id_and_mask: pack_24_8(instance_id, INSTANCE_MASK_ALL),
            contribution_and_flags: pack_24_8(contribution, 0),
            blas_address,
        }
    }

    /// Instance id (24 bits).
    pub const fn instance_id(&self) -> u32 {
        self.instance_id_and_mask & MAX_INSTANCE_FIELD
    }

    /// Visibility mask.
    pub const fn mask(&self) -> u8 {
        (self.instance_id_and_mask >> 24) as u8
    }

    /// Hit-group contribution added to the hit-group index at dispatch.
    pub const fn hit_group_contribution(&self) -> u32 {
        self.contribution_and_flags & MAX_INSTANCE_FIELD
    }

    /// Instance flag bits.
    pub const fn flags(&self) -> u8 {
        (self.contribution_and_flags >> 24) as u8
    }

    /// The object-to-world transform as a 4x4 matrix.
    pub fn transform_matrix(&self) -> Mat4 {
        let t = &self.transform;
        Mat4::from_cols(
            Vec4::new(t[0], t[4], t[8], 0.0),
            Vec4::new(t[1], t[5], t[9], 0.0),
            Vec4::new(t[2], t[6], t[10], 0.0),
            Vec4::new(t[3], t[7], t[11], 1.0),
        )
    }
}

/// Top three rows of a matrix, row by row.
pub fn row_major_3x4(matrix: &Mat4) -> [f32; 12] {
    let mut out = [0.0; 12];
    for row in 0..3 {
        out[row * 4..row * 4 + 4].copy_from_slice(&matrix.row(row).to_array());
    }
    out
}

#[inline]
const fn pack_24_8(low: u32, high: u8) -> u32 {
    (low & MAX_INSTANCE_FIELD) | ((high as u32) << 24)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use glam::Quat;

    #[test]
    fn descriptor_size() {
        assert_eq!(
            std::mem::size_of::<InstanceDescriptor>() as u64,
            crate::constants::INSTANCE_DESCRIPTOR_SIZE
        );
    }

    #[test]
    fn descriptor_packing() {
        let desc = InstanceDescriptor::new(&Mat4::IDENTITY, 5, 10, 0xDEAD_BEEF_0000);
        assert_eq!(desc.instance_id(), 5);
        assert_eq!(desc.mask(), 0xFF);
        assert_eq!(desc.hit_group_contribution(), 10);
        assert_eq!(desc.flags(), 0);

        let bytes = bytemuck::bytes_of(&desc);
        assert_eq!(&bytes[48..52], &(5u32 | 0xFF00_0000).to_ne_bytes());
        assert_eq!(&bytes[52..56], &10u32.to_ne_bytes());
        assert_eq!(&bytes[56..64], &0xDEAD_BEEF_0000u64.to_ne_bytes());
    }

    #[test]
    fn transform_is_row_major() {
        let m = Mat4::from_translation(Vec3::new(1.0, 2.0, 3.0));
        let rows = row_major_3x4(&m);
        assert_eq!(
            rows,
            [1.0, 0.0, 0.0, 1.0, 0.0, 1.0, 0.0, 2.0, 0.0, 0.0, 1.0, 3.0]
        );
    }

    #[test]
    fn transform_round_trip() {
        let m = Mat4::from_scale_rotation_translation(
            Vec3::new(2.0, 1.0, 0.5),
            Quat::from_rotation_y(0.7),
            Vec3::new(-4.0, 3.0, 9.0),
        );
        let desc = InstanceDescriptor::new(&m, 0, 0, 0);
        let back = desc.transform_matrix();
        for (a, b) in m.to_cols_array().iter().zip(back.to_cols_array().iter()) {
            assert_relative_eq!(*a, *b, epsilon = 1e-6);
        }
    }

    #[test]
    fn ray_hits_triangle() {
        let ray = Ray::new(Vec3::new(0.25, 0.25, -1.0), Vec3::Z);
        let t = ray
            .intersect_triangle(Vec3::ZERO, Vec3::X, Vec3::Y, 0.0)
            .expect("hit");
        assert_relative_eq!(t, 1.0);
        assert_relative_eq!(ray.at(t).z, 0.0);

        let miss = Ray::new(Vec3::new(2.0, 2.0, -1.0), Vec3::Z);
        assert!(miss
            .intersect_triangle(Vec3::ZERO, Vec3::X, Vec3::Y, 0.0)
            .is_none());
    }
}
