//! Raw vertex / index data of one mesh asset and its GPU copies.

use std::mem;

use bytemuck::Pod;
use glam::{Vec2, Vec3};

use crate::context::GpuContext;
use crate::device::{BufferId, BufferView, Device, GpuAddress, IndexFormat};
use crate::{ContractViolation, Result};

pub const POSITION_STRIDE: u64 = 12;
pub const NORMAL_STRIDE: u64 = 12;
pub const UV_STRIDE: u64 = 8;

/// Index element type; only 16-bit and 32-bit unsigned integers qualify.
pub trait IndexElement: Pod + private::Sealed {
    const FORMAT: IndexFormat;
}

impl IndexElement for u16 {
    const FORMAT: IndexFormat = IndexFormat::U16;
}

impl IndexElement for u32 {
    const FORMAT: IndexFormat = IndexFormat::U32;
}

mod private {
    pub trait Sealed {}

    impl Sealed for u16 {}
    impl Sealed for u32 {}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Stream {
    pub buffer: BufferId,
    pub count: usize,
    pub srv: Option<u32>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IndexStream {
    pub stream: Stream,
    pub format: IndexFormat,
}

/// Shader-visible descriptor indices of a geometry's attribute buffers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AttributeSlots {
    pub index: Option<u32>,
    pub normal: Option<u32>,
    pub uv0: Option<u32>,
}

/// Vertex and index buffers of a single mesh asset.
///
/// The first attribute set fixes the vertex count; every later attribute must
/// match it. The index width is fixed by the first index set.
#[derive(Debug)]
pub struct GeometryBuffer {
    label: String,
    vertex_count: Option<usize>,
    positions: Option<Stream>,
    normals: Option<Stream>,
    uv0: Option<Stream>,
    indices: Option<IndexStream>,
}

impl GeometryBuffer {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            vertex_count: None,
            positions: None,
            normals: None,
            uv0: None,
            indices: None,
        }
    }

    pub fn set_positions<D>(&mut self, ctx: &mut GpuContext<D>, positions: &[Vec3]) -> Result<()>
    where
        D: Device,
    {
        self.check_vertex_count("positions", positions.len())?;

        let stream = upload_stream(
            ctx,
            &format!("{}_positions", self.label),
            positions,
            self.positions,
            None,
        )?;

        self.vertex_count = Some(positions.len());
        self.positions = Some(stream);

        Ok(())
    }

    pub fn set_normals<D>(&mut self, ctx: &mut GpuContext<D>, normals: &[Vec3]) -> Result<()>
    where
        D: Device,
    {
        self.check_vertex_count("normals", normals.len())?;

        let stream = upload_stream(
            ctx,
            &format!("{}_normals", self.label),
            normals,
            self.normals,
            Some(NORMAL_STRIDE as u32),
        )?;

        self.vertex_count = Some(normals.len());
        self.normals = Some(stream);

        Ok(())
    }

    pub fn set_uv0<D>(&mut self, ctx: &mut GpuContext<D>, uv0: &[Vec2]) -> Result<()>
    where
        D: Device,
    {
        self.check_vertex_count("uv0s", uv0.len())?;

        let stream = upload_stream(
            ctx,
            &format!("{}_uv0", self.label),
            uv0,
            self.uv0,
            Some(UV_STRIDE as u32),
        )?;

        self.vertex_count = Some(uv0.len());
        self.uv0 = Some(stream);

        Ok(())
    }

    pub fn set_indices<D, I>(&mut self, ctx: &mut GpuContext<D>, indices: &[I]) -> Result<()>
    where
        D: Device,
        I: IndexElement,
    {
        if let Some(existing) = self.indices {
            if existing.format != I::FORMAT {
                return Err(ContractViolation::IndexFormatChanged.into());
            }
        }

        let stream = upload_stream(
            ctx,
            &format!("{}_indices", self.label),
            indices,
            self.indices.map(|indices| indices.stream),
            Some(I::FORMAT.byte_width()),
        )?;

        self.indices = Some(IndexStream {
            stream,
            format: I::FORMAT,
        });

        Ok(())
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn vertex_count(&self) -> Option<usize> {
        self.vertex_count
    }

    pub fn positions(&self) -> Option<Stream> {
        self.positions
    }

    pub fn indices(&self) -> Option<IndexStream> {
        self.indices
    }

    pub fn attribute_slots(&self) -> AttributeSlots {
        AttributeSlots {
            index: self.indices.and_then(|indices| indices.stream.srv),
            normal: self.normals.and_then(|normals| normals.srv),
            uv0: self.uv0.and_then(|uv0| uv0.srv),
        }
    }

    pub fn position_address<D>(&self, device: &D) -> Option<GpuAddress>
    where
        D: Device + ?Sized,
    {
        self.positions
            .map(|positions| device.buffer_address(positions.buffer))
    }

    fn check_vertex_count(&self, attribute: &'static str, actual: usize) -> Result<()> {
        match self.vertex_count {
            Some(expected) if expected != actual => Err(ContractViolation::VertexCountMismatch {
                attribute,
                expected,
                actual,
            }
            .into()),
            _ => Ok(()),
        }
    }
}

/// Uploads `data`, replacing `previous` and reusing its descriptor index.
fn upload_stream<D, T>(
    ctx: &mut GpuContext<D>,
    label: &str,
    data: &[T],
    previous: Option<Stream>,
    view_stride: Option<u32>,
) -> Result<Stream>
where
    D: Device,
    T: Pod,
{
    let buffer = ctx
        .device
        .create_upload_buffer(label, bytemuck::cast_slice(data))?;

    if let Some(previous) = previous {
        ctx.device.release_buffer(previous.buffer);
    }

    let srv = match view_stride {
        Some(stride) => {
            debug_assert_eq!(stride as usize, mem::size_of::<T>());

            let descriptor = match previous.and_then(|previous| previous.srv) {
                Some(descriptor) => descriptor,
                None => ctx.descriptors.next_index()?,
            };

            ctx.device.create_buffer_view(
                buffer,
                BufferView {
                    descriptor,
                    stride,
                    count: data.len() as u32,
                },
            )?;

            Some(descriptor)
        }
        None => None,
    };

    Ok(Stream {
        buffer,
        count: data.len(),
        srv,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::headless::HeadlessDevice;
    use crate::Error;

    fn ctx() -> GpuContext<HeadlessDevice> {
        GpuContext::new(HeadlessDevice::new())
    }

    fn quad() -> Vec<Vec3> {
        vec![
            Vec3::new(-1.0, -1.0, 0.0),
            Vec3::new(1.0, -1.0, 0.0),
            Vec3::new(1.0, 1.0, 0.0),
            Vec3::new(-1.0, 1.0, 0.0),
        ]
    }

    #[test]
    fn attribute_counts_must_match_vertex_count() {
        let mut ctx = ctx();
        let mut geometry = GeometryBuffer::new("quad");

        geometry.set_positions(&mut ctx, &quad()).unwrap();

        for count in [3, 5] {
            let err = geometry
                .set_normals(&mut ctx, &vec![Vec3::Z; count])
                .unwrap_err();

            assert!(matches!(
                err,
                Error::Contract(ContractViolation::VertexCountMismatch {
                    attribute: "normals",
                    expected: 4,
                    actual,
                }) if actual == count
            ));

            assert!(geometry
                .set_uv0(&mut ctx, &vec![Vec2::ZERO; count])
                .is_err());
        }

        geometry.set_normals(&mut ctx, &[Vec3::Z; 4]).unwrap();
        geometry.set_uv0(&mut ctx, &[Vec2::ZERO; 4]).unwrap();

        assert_eq!(Some(4), geometry.vertex_count());
    }

    #[test]
    fn first_attribute_fixes_vertex_count() {
        let mut ctx = ctx();
        let mut geometry = GeometryBuffer::new("quad");

        geometry.set_uv0(&mut ctx, &[Vec2::ZERO; 4]).unwrap();

        assert!(geometry.set_positions(&mut ctx, &quad()[..3]).is_err());
        assert!(geometry.set_positions(&mut ctx, &quad()).is_ok());
    }

    #[test]
    fn index_width_is_immutable() {
        let mut ctx = ctx();
        let mut geometry = GeometryBuffer::new("quad");

        geometry.set_indices(&mut ctx, &[0u16, 1, 2]).unwrap();
        geometry.set_indices(&mut ctx, &[0u16, 2, 3]).unwrap();

        let err = geometry.set_indices(&mut ctx, &[0u32, 1, 2]).unwrap_err();

        assert!(matches!(
            err,
            Error::Contract(ContractViolation::IndexFormatChanged)
        ));
        assert_eq!(IndexFormat::U16, geometry.indices().unwrap().format);
    }

    #[test]
    fn views_are_created_for_shader_visible_attributes() {
        let mut ctx = ctx();
        let mut geometry = GeometryBuffer::new("quad");

        geometry.set_positions(&mut ctx, &quad()).unwrap();

        assert_eq!(AttributeSlots::default(), geometry.attribute_slots());

        geometry.set_normals(&mut ctx, &[Vec3::Z; 4]).unwrap();
        geometry.set_indices(&mut ctx, &[0u32, 1, 2, 0, 2, 3]).unwrap();

        let slots = geometry.attribute_slots();

        assert_eq!(Some(1), slots.normal);
        assert_eq!(Some(2), slots.index);
        assert_eq!(None, slots.uv0);

        // Re-uploading keeps the descriptor index
        geometry.set_normals(&mut ctx, &[Vec3::Y; 4]).unwrap();

        assert_eq!(Some(1), geometry.attribute_slots().normal);
        assert_eq!(2, ctx.descriptors.allocated());

        let views = ctx.device.views();

        assert_eq!(2, views.len());
        assert!(views
            .iter()
            .any(|(_, view)| view.descriptor == 2 && view.stride == 4 && view.count == 6));
    }
}
