//! Per-frame binding and ray dispatch recording.

use bytemuck::Pod;
use glam::{Mat4, Vec3};

use crate::device::{Command, CommandListId, Device, GpuAddress};
use crate::pipeline::{RaytracingPipeline, RootParameter};
use crate::{ContractViolation, Result};

/// Positional 32-bit root constants.
///
/// The push order is the layout the shaders declare; values are never
/// addressed by name.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RootConstants {
    values: Vec<u32>,
}

impl RootConstants {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_u32(&mut self, value: u32) -> &mut Self {
        self.values.push(value);
        self
    }

    pub fn push_f32(&mut self, value: f32) -> &mut Self {
        self.values.push(value.to_bits());
        self
    }

    pub fn push_vec3(&mut self, value: Vec3) -> &mut Self {
        self.push_pod(&value.to_array())
    }

    /// Column-major, the packing HLSL uses for `float4x4` by default.
    pub fn push_mat4(&mut self, value: &Mat4) -> &mut Self {
        self.push_pod(&value.to_cols_array())
    }

    /// Appends any plain-old-data block made of 32-bit fields.
    pub fn push_pod<T>(&mut self, value: &T) -> &mut Self
    where
        T: Pod,
    {
        let bytes = bytemuck::bytes_of(value);

        debug_assert_eq!(0, bytes.len() % 4);

        self.values.extend(
            bytes
                .chunks_exact(4)
                .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]])),
        );
        self
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn values(&self) -> &[u32] {
        &self.values
    }
}

/// Value for one root parameter of the pipeline's root signature.
#[derive(Clone, Debug, PartialEq)]
pub enum Binding {
    Constants(RootConstants),
    ShaderResourceView(GpuAddress),
}

/// Records root signature, bindings (in parameter order), pipeline state and
/// a `width` x `height` x 1 ray dispatch into `list`.
///
/// Every binding is checked against the root signature before anything is
/// recorded.
pub fn record_dispatch<D>(
    device: &mut D,
    list: CommandListId,
    pipeline: &RaytracingPipeline,
    bindings: &[Binding],
    width: u32,
    height: u32,
) -> Result<()>
where
    D: Device + ?Sized,
{
    let parameters = &pipeline.layout().parameters;

    if parameters.len() != bindings.len() {
        return Err(ContractViolation::RootParameterMismatch(bindings.len() as u32).into());
    }

    for (index, (parameter, binding)) in parameters.iter().zip(bindings).enumerate() {
        let matches = match (parameter, binding) {
            (RootParameter::Constants { count, .. }, Binding::Constants(constants)) => {
                *count as usize == constants.len()
            }
            (RootParameter::ShaderResourceView { .. }, Binding::ShaderResourceView(_)) => true,
            _ => false,
        };

        if !matches {
            return Err(ContractViolation::RootParameterMismatch(index as u32).into());
        }
    }

    device.record(list, Command::SetRootSignature(pipeline.root_signature()))?;

    for (parameter, binding) in bindings.iter().enumerate() {
        let parameter = parameter as u32;

        let command = match binding {
            Binding::Constants(constants) => Command::SetRootConstants {
                parameter,
                offset: 0,
                values: constants.values().to_vec(),
            },
            Binding::ShaderResourceView(address) => Command::SetRootShaderResourceView {
                parameter,
                address: *address,
            },
        };

        device.record(list, command)?;
    }

    device.record(list, Command::SetPipelineState(pipeline.state_object()))?;
    device.record(
        list,
        Command::DispatchRays(pipeline.dispatch_desc(width, height)),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::GpuContext;
    use crate::device::headless::HeadlessDevice;
    use crate::pipeline::{HitGroup, PipelineDescriptor, RootSignatureLayout};
    use crate::Error;

    fn pipeline(ctx: &mut GpuContext<HeadlessDevice>) -> RaytracingPipeline {
        let desc = PipelineDescriptor {
            ray_generation: "RayGenMain".into(),
            hit_groups: vec![HitGroup::triangles("HitGroup", "ClosestMain")],
            miss_shaders: vec!["MissMain".into()],
            library: Vec::new(),
            max_recursion_depth: 1,
            payload_size: 16,
            attribute_size: 8,
            root_signature: RootSignatureLayout::new()
                .constants(0, 20)
                .shader_resource_view(0)
                .directly_indexed(),
        };

        RaytracingPipeline::new(ctx, &desc).unwrap()
    }

    fn camera_block() -> RootConstants {
        let mut constants = RootConstants::new();

        constants
            .push_mat4(&Mat4::IDENTITY)
            .push_vec3(Vec3::new(0.0, -1.0, 0.0))
            .push_u32(1);

        constants
    }

    #[test]
    fn constants_are_positional() {
        let constants = camera_block();
        let values = constants.values();

        assert_eq!(20, values.len());
        assert_eq!(1.0f32.to_bits(), values[0]);
        assert_eq!(0.0f32.to_bits(), values[1]);
        assert_eq!(1.0f32.to_bits(), values[5]);
        assert_eq!((-1.0f32).to_bits(), values[17]);
        assert_eq!(1, values[19]);
    }

    #[test]
    fn translation_is_in_the_fourth_column() {
        let mut constants = RootConstants::new();

        constants.push_mat4(&Mat4::from_translation(Vec3::new(2.5, 2.5, 2.5)));

        assert_eq!(2.5f32.to_bits(), constants.values()[12]);
        assert_eq!(1.0f32.to_bits(), constants.values()[15]);
    }

    #[test]
    fn records_in_binding_order() {
        let mut ctx = GpuContext::new(HeadlessDevice::new());
        let pipeline = pipeline(&mut ctx);
        let list = ctx.device.create_command_list().unwrap();

        record_dispatch(
            &mut ctx.device,
            list,
            &pipeline,
            &[
                Binding::Constants(camera_block()),
                Binding::ShaderResourceView(0x4000),
            ],
            800,
            600,
        )
        .unwrap();

        let commands = ctx.device.commands(list);

        assert_eq!(5, commands.len());
        assert_eq!(Command::SetRootSignature(pipeline.root_signature()), commands[0]);
        assert!(matches!(
            &commands[1],
            Command::SetRootConstants { parameter: 0, offset: 0, values } if values.len() == 20
        ));
        assert_eq!(
            Command::SetRootShaderResourceView {
                parameter: 1,
                address: 0x4000
            },
            commands[2]
        );
        assert_eq!(Command::SetPipelineState(pipeline.state_object()), commands[3]);

        let Command::DispatchRays(dispatch) = &commands[4] else {
            panic!("expected a dispatch");
        };

        assert_eq!((800, 600, 1), (dispatch.width, dispatch.height, dispatch.depth));
        assert_eq!(
            pipeline.hit_group_table().stride(),
            dispatch.hit_group.stride
        );
    }

    #[test]
    fn mismatched_bindings_record_nothing() {
        let mut ctx = GpuContext::new(HeadlessDevice::new());
        let pipeline = pipeline(&mut ctx);
        let list = ctx.device.create_command_list().unwrap();

        let mut short = RootConstants::new();
        short.push_u32(1);

        let err = record_dispatch(
            &mut ctx.device,
            list,
            &pipeline,
            &[
                Binding::Constants(short),
                Binding::ShaderResourceView(0x4000),
            ],
            800,
            600,
        )
        .unwrap_err();

        assert!(matches!(
            err,
            Error::Contract(ContractViolation::RootParameterMismatch(0))
        ));

        let err = record_dispatch(
            &mut ctx.device,
            list,
            &pipeline,
            &[
                Binding::ShaderResourceView(0x4000),
                Binding::Constants(camera_block()),
            ],
            800,
            600,
        )
        .unwrap_err();

        assert!(matches!(
            err,
            Error::Contract(ContractViolation::RootParameterMismatch(0))
        ));
        assert!(ctx.device.commands(list).is_empty());
    }

    #[test]
    fn dispatch_into_submitted_list_fails() {
        let mut ctx = GpuContext::new(HeadlessDevice::new());
        let pipeline = pipeline(&mut ctx);
        let list = ctx.device.create_command_list().unwrap();

        ctx.device.submit(&[list]).unwrap();

        let err = record_dispatch(
            &mut ctx.device,
            list,
            &pipeline,
            &[
                Binding::Constants(camera_block()),
                Binding::ShaderResourceView(0x4000),
            ],
            800,
            600,
        )
        .unwrap_err();

        assert!(matches!(err, Error::Submission(_)));
        assert!(ctx.device.commands(list).is_empty());
    }
}
