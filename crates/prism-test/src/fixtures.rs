//! Scene and shader fixtures for builder tests.

use glam::Vec3;
use prism_core::{
    BufferUsage, DescriptorKind, DescriptorRange, GeometryHandle, GeometryId, HitBinding,
    HitGroupDesc, IndexFormat, LocalSignatureAssociation, MeshDesc, RootParameter,
    RootSignatureDesc, ShaderExport, ShaderLibrary, ShaderRecordDesc, ShaderSet, ShaderStage,
};

use crate::mock::MockDevice;

/// Payload size declared by every fixture export.
pub const PAYLOAD_SIZE: u32 = 16;
/// Attribute size declared by the fixture hit shaders (barycentrics).
pub const ATTRIBUTE_SIZE: u32 = 8;

/// Upload `vertices` as a non-indexed triangle list.
pub fn triangle_mesh(
    device: &mut MockDevice,
    id: GeometryId,
    vertices: &[Vec3],
) -> prism_core::Result<MeshDesc> {
    let buffer = device.upload_buffer(
        bytemuck::cast_slice(vertices),
        BufferUsage::BUILD_INPUT,
        &format!("mesh{}_vertices", id.0),
    )?;
    Ok(MeshDesc::single(
        id,
        GeometryHandle::triangles(buffer, vertices.len() as u32),
    ))
}

/// Upload an indexed quad spanning `[-half, half]` on X and Y at z = 0.
pub fn quad_mesh(device: &mut MockDevice, id: GeometryId, half: f32) -> prism_core::Result<MeshDesc> {
    let vertices = [
        Vec3::new(-half, -half, 0.0),
        Vec3::new(half, -half, 0.0),
        Vec3::new(half, half, 0.0),
        Vec3::new(-half, half, 0.0),
    ];
    let indices: [u16; 6] = [0, 1, 2, 0, 2, 3];
    let vertex_buffer = device.upload_buffer(
        bytemuck::cast_slice(&vertices),
        BufferUsage::BUILD_INPUT,
        &format!("mesh{}_vertices", id.0),
    )?;
    let index_buffer = device.upload_buffer(
        bytemuck::cast_slice(&indices),
        BufferUsage::BUILD_INPUT,
        &format!("mesh{}_indices", id.0),
    )?;
    Ok(MeshDesc::single(
        id,
        GeometryHandle::triangles(vertex_buffer, 4).with_indices(
            index_buffer,
            6,
            IndexFormat::Uint16,
        ),
    ))
}

/// Local arguments stored in fixture hit records: identifies binding and ray type.
pub fn hit_record_arguments(binding: u32, ray_type: u32) -> Vec<u8> {
    ((u64::from(binding) << 8) | u64::from(ray_type))
        .to_le_bytes()
        .to_vec()
}

/// Shader set with one library, one ray generation shader, and per ray type
/// one miss shader and one hit group. Ray type 0 uses `Miss`/`HitGroup`,
/// further ray types use `ShadowMiss`/`ShadowHitGroup`.
///
/// Every hit record carries an 8-byte local argument block (one root
/// descriptor) made by [`hit_record_arguments`].
pub fn simple_shader_set(ray_type_count: u32, hit_binding_count: u32) -> ShaderSet {
    let shadows = ray_type_count > 1;

    let mut exports = vec![
        ShaderExport::new("RayGen", ShaderStage::RayGeneration).with_payload(PAYLOAD_SIZE),
        ShaderExport::new("Miss", ShaderStage::Miss).with_payload(PAYLOAD_SIZE),
        ShaderExport::new("ClosestHit", ShaderStage::ClosestHit)
            .with_payload(PAYLOAD_SIZE)
            .with_attributes(ATTRIBUTE_SIZE),
    ];
    let mut hit_groups = vec![HitGroupDesc::closest_hit("HitGroup", "ClosestHit")];
    if shadows {
        exports.push(ShaderExport::new("ShadowMiss", ShaderStage::Miss).with_payload(PAYLOAD_SIZE));
        exports.push(
            ShaderExport::new("ShadowHit", ShaderStage::ClosestHit)
                .with_payload(PAYLOAD_SIZE)
                .with_attributes(ATTRIBUTE_SIZE),
        );
        hit_groups.push(HitGroupDesc::closest_hit("ShadowHitGroup", "ShadowHit"));
    }

    let global_signature = RootSignatureDesc::new(
        "Global",
        vec![RootParameter::DescriptorTable(vec![
            DescriptorRange {
                kind: DescriptorKind::StorageImage,
                binding: 0,
                count: 1,
            },
            DescriptorRange {
                kind: DescriptorKind::AccelerationStructure,
                binding: 1,
                count: 1,
            },
        ])],
    );
    let hit_signature = RootSignatureDesc::new(
        "HitLocal",
        vec![RootParameter::Descriptor {
            kind: DescriptorKind::StorageBuffer,
            binding: 2,
        }],
    );
    let associations = vec![LocalSignatureAssociation {
        signature: "HitLocal".to_string(),
        programs: hit_groups.iter().map(|group| group.name.clone()).collect(),
    }];

    let miss = (0..ray_type_count)
        .map(|ray_type| ShaderRecordDesc::new(if ray_type == 0 { "Miss" } else { "ShadowMiss" }))
        .collect();
    let hit_bindings = (0..hit_binding_count)
        .map(|binding| {
            HitBinding::new(
                (0..ray_type_count)
                    .map(|ray_type| {
                        let group = if ray_type == 0 {
                            "HitGroup"
                        } else {
                            "ShadowHitGroup"
                        };
                        ShaderRecordDesc::new(group)
                            .with_arguments(hit_record_arguments(binding, ray_type))
                    })
                    .collect(),
            )
        })
        .collect();

    ShaderSet {
        libraries: vec![ShaderLibrary {
            name: "main".to_string(),
            code: vec![0x44, 0x58, 0x42, 0x43],
            exports,
        }],
        hit_groups,
        global_signature,
        local_signatures: vec![hit_signature],
        associations,
        ray_gen: ShaderRecordDesc::new("RayGen"),
        miss,
        hit_bindings,
    }
}

/// A mock device preloaded with a triangle (mesh 0) and an indexed quad (mesh 1).
pub struct SceneFixture {
    pub device: MockDevice,
    pub meshes: Vec<MeshDesc>,
    pub shaders: ShaderSet,
}

impl SceneFixture {
    pub const TRIANGLE: GeometryId = GeometryId(0);
    pub const QUAD: GeometryId = GeometryId(1);

    pub fn new(ray_type_count: u32, hit_binding_count: u32) -> prism_core::Result<Self> {
        let mut device = MockDevice::new();
        let triangle = triangle_mesh(
            &mut device,
            Self::TRIANGLE,
            &[
                Vec3::new(-1.0, -1.0, 0.0),
                Vec3::new(1.0, -1.0, 0.0),
                Vec3::new(0.0, 1.0, 0.0),
            ],
        )?;
        let quad = quad_mesh(&mut device, Self::QUAD, 1.0)?;
        Ok(Self {
            device,
            meshes: vec![triangle, quad],
            shaders: simple_shader_set(ray_type_count, hit_binding_count),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shader_set_shape() {
        let single = simple_shader_set(1, 2);
        assert_eq!(single.miss.len(), 1);
        assert_eq!(single.hit_groups.len(), 1);
        assert_eq!(single.hit_bindings.len(), 2);
        assert_eq!(single.hit_bindings[1].records[0].local_arguments, hit_record_arguments(1, 0));

        let shadowed = simple_shader_set(2, 1);
        assert_eq!(shadowed.miss[1].program, "ShadowMiss");
        assert_eq!(shadowed.hit_bindings[0].records[1].program, "ShadowHitGroup");
    }

    #[test]
    fn fixture_uploads_geometry() {
        let fixture = SceneFixture::new(1, 1).unwrap();
        assert_eq!(fixture.meshes[0].primitive_count(), 1);
        assert_eq!(fixture.meshes[1].primitive_count(), 2);
        // triangle vertices, quad vertices, quad indices
        assert_eq!(fixture.device.live_buffer_count(), 3);
    }
}
