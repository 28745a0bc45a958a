//! Translation of build inputs into `VK_KHR_acceleration_structure` structs.

use ash::vk;
use prism_core::{
    BufferHandle, BuildFlags, BuildInputs, GeometryHandle, GeometryInputs, IndexFormat, Registry,
    VertexFormat,
};

use crate::device::DeviceBuffer;

pub fn build_flags(flags: BuildFlags) -> vk::BuildAccelerationStructureFlagsKHR {
    let mut out = vk::BuildAccelerationStructureFlagsKHR::empty();
    if flags.contains(BuildFlags::PREFER_FAST_TRACE) {
        out |= vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE;
    }
    if flags.contains(BuildFlags::PREFER_FAST_BUILD) {
        out |= vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_BUILD;
    }
    if flags.contains(BuildFlags::ALLOW_UPDATE) {
        out |= vk::BuildAccelerationStructureFlagsKHR::ALLOW_UPDATE;
    }
    out
}

pub const fn vertex_format(format: VertexFormat) -> vk::Format {
    match format {
        VertexFormat::Float32x3 => vk::Format::R32G32B32_SFLOAT,
    }
}

pub const fn index_type(format: IndexFormat) -> vk::IndexType {
    match format {
        IndexFormat::Uint16 => vk::IndexType::UINT16,
        IndexFormat::Uint32 => vk::IndexType::UINT32,
    }
}

pub const fn structure_type(inputs: &GeometryInputs<'_>) -> vk::AccelerationStructureTypeKHR {
    if inputs.is_top_level() {
        vk::AccelerationStructureTypeKHR::TOP_LEVEL
    } else {
        vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL
    }
}

/// Geometry array and matching build ranges of one build.
pub(crate) struct GeometryBuild {
    pub geometries: Vec<vk::AccelerationStructureGeometryKHR<'static>>,
    pub ranges: Vec<vk::AccelerationStructureBuildRangeInfoKHR>,
}

impl GeometryBuild {
    /// Resolve `inputs` against live buffers.
    ///
    /// `instance_buffer` is only read for top-level inputs; size queries pass
    /// `None` and get a null address.
    pub fn new(
        buffers: &Registry<BufferHandle, DeviceBuffer>,
        inputs: &BuildInputs<'_>,
        instance_buffer: Option<BufferHandle>,
    ) -> prism_core::Result<Self> {
        match inputs.geometry {
            GeometryInputs::Triangles(geometries) => {
                let mut build = Self {
                    geometries: Vec::with_capacity(geometries.len()),
                    ranges: Vec::with_capacity(geometries.len()),
                };
                for geometry in geometries {
                    build.geometries.push(triangles(buffers, geometry)?);
                    build.ranges.push(
                        vk::AccelerationStructureBuildRangeInfoKHR::default()
                            .primitive_count(geometry.primitive_count()),
                    );
                }
                Ok(build)
            }
            GeometryInputs::Instances { count } => {
                let address = match instance_buffer {
                    Some(handle) => buffers.get(handle)?.address,
                    None => 0,
                };
                let geometry = vk::AccelerationStructureGeometryKHR::default()
                    .geometry_type(vk::GeometryTypeKHR::INSTANCES)
                    .geometry(vk::AccelerationStructureGeometryDataKHR {
                        instances: vk::AccelerationStructureGeometryInstancesDataKHR::default()
                            .array_of_pointers(false)
                            .data(vk::DeviceOrHostAddressConstKHR {
                                device_address: address,
                            }),
                    });
                Ok(Self {
                    geometries: vec![geometry],
                    ranges: vec![
                        vk::AccelerationStructureBuildRangeInfoKHR::default().primitive_count(count),
                    ],
                })
            }
        }
    }

    /// Primitive count per geometry, as the size query expects.
    pub fn primitive_counts(&self) -> Vec<u32> {
        self.ranges.iter().map(|range| range.primitive_count).collect()
    }
}

fn triangles(
    buffers: &Registry<BufferHandle, DeviceBuffer>,
    geometry: &GeometryHandle,
) -> prism_core::Result<vk::AccelerationStructureGeometryKHR<'static>> {
    let vertex_address = buffers.get(geometry.vertex_buffer)?.address;
    let mut data = vk::AccelerationStructureGeometryTrianglesDataKHR::default()
        .vertex_format(vertex_format(geometry.vertex_format))
        .vertex_data(vk::DeviceOrHostAddressConstKHR {
            device_address: vertex_address,
        })
        .vertex_stride(geometry.vertex_stride)
        .max_vertex(geometry.vertex_count.saturating_sub(1))
        .index_type(vk::IndexType::NONE_KHR);
    if let Some(indices) = geometry.index_buffer {
        data = data
            .index_type(index_type(indices.format))
            .index_data(vk::DeviceOrHostAddressConstKHR {
                device_address: buffers.get(indices.buffer)?.address,
            });
    }

    let flags = if geometry.opaque {
        vk::GeometryFlagsKHR::OPAQUE
    } else {
        vk::GeometryFlagsKHR::empty()
    };
    Ok(vk::AccelerationStructureGeometryKHR::default()
        .geometry_type(vk::GeometryTypeKHR::TRIANGLES)
        .flags(flags)
        .geometry(vk::AccelerationStructureGeometryDataKHR { triangles: data }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_translation() {
        let flags = build_flags(BuildFlags::PREFER_FAST_TRACE | BuildFlags::ALLOW_UPDATE);
        assert!(flags.contains(vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE));
        assert!(flags.contains(vk::BuildAccelerationStructureFlagsKHR::ALLOW_UPDATE));
        assert!(!flags.contains(vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_BUILD));
    }

    #[test]
    fn formats() {
        assert_eq!(vertex_format(VertexFormat::Float32x3), vk::Format::R32G32B32_SFLOAT);
        assert_eq!(index_type(IndexFormat::Uint16), vk::IndexType::UINT16);
        assert_eq!(
            structure_type(&GeometryInputs::Instances { count: 0 }),
            vk::AccelerationStructureTypeKHR::TOP_LEVEL
        );
    }

    #[test]
    fn instance_query_needs_no_buffer() {
        let buffers = Registry::new();
        let build = GeometryBuild::new(
            &buffers,
            &BuildInputs {
                geometry: GeometryInputs::Instances { count: 7 },
                flags: BuildFlags::PREFER_FAST_TRACE,
            },
            None,
        )
        .unwrap();
        assert_eq!(build.primitive_counts(), vec![7]);
    }
}
