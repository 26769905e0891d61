//! Ray tracing pipeline: root signature, state object and shader tables.

pub mod shader_table;

use fxhash::FxHashSet;

pub use shader_table::ShaderTable;

use crate::context::GpuContext;
use crate::device::{
    Device, DispatchRaysDesc, RootSignatureId, StateObjectDesc, StateObjectId,
};
use crate::{ContractViolation, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HitGroupKind {
    /// Built-in triangle intersection.
    Triangles,
    /// AABB primitives with a custom intersection shader.
    Procedural,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HitGroup {
    pub export: String,
    pub kind: HitGroupKind,
    pub closest_hit: Option<String>,
    pub any_hit: Option<String>,
    pub intersection: Option<String>,
}

impl HitGroup {
    pub fn triangles(export: impl Into<String>, closest_hit: impl Into<String>) -> Self {
        Self {
            export: export.into(),
            kind: HitGroupKind::Triangles,
            closest_hit: Some(closest_hit.into()),
            any_hit: None,
            intersection: None,
        }
    }

    pub fn procedural(
        export: impl Into<String>,
        closest_hit: impl Into<String>,
        intersection: impl Into<String>,
    ) -> Self {
        Self {
            export: export.into(),
            kind: HitGroupKind::Procedural,
            closest_hit: Some(closest_hit.into()),
            any_hit: None,
            intersection: Some(intersection.into()),
        }
    }

    pub fn with_any_hit(mut self, any_hit: impl Into<String>) -> Self {
        self.any_hit = Some(any_hit.into());
        self
    }

    /// Imports wired into the hit-group subobject; empty names are left out.
    pub fn imports(&self) -> impl Iterator<Item = &str> {
        [&self.closest_hit, &self.any_hit, &self.intersection]
            .into_iter()
            .flatten()
            .map(String::as_str)
            .filter(|name| !name.is_empty())
    }

    fn validate(&self) -> Result<()> {
        if self.export.is_empty() {
            return Err(ContractViolation::EmptyExportName.into());
        }

        let intersection = self
            .intersection
            .as_deref()
            .map_or(false, |name| !name.is_empty());

        match self.kind {
            HitGroupKind::Triangles if intersection => Err(
                ContractViolation::IntersectionOnTriangleHitGroup(self.export.clone()).into(),
            ),
            HitGroupKind::Procedural if !intersection => {
                Err(ContractViolation::MissingIntersection(self.export.clone()).into())
            }
            _ => Ok(()),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RootParameter {
    /// 32-bit root constants bound to `b{register}`.
    Constants { register: u32, space: u32, count: u32 },
    /// Root shader-resource view bound to `t{register}`.
    ShaderResourceView { register: u32, space: u32 },
}

/// Linear-filtered, wrapping sampler visible to every stage.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StaticSampler {
    pub register: u32,
    pub space: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RootSignatureLayout {
    pub parameters: Vec<RootParameter>,
    pub static_samplers: Vec<StaticSampler>,
    /// Lets shaders index the CBV/SRV/UAV heap directly.
    pub directly_indexed: bool,
}

impl RootSignatureLayout {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn constants(mut self, register: u32, count: u32) -> Self {
        self.parameters.push(RootParameter::Constants {
            register,
            space: 0,
            count,
        });
        self
    }

    pub fn shader_resource_view(mut self, register: u32) -> Self {
        self.parameters
            .push(RootParameter::ShaderResourceView { register, space: 0 });
        self
    }

    pub fn static_sampler(mut self, register: u32) -> Self {
        self.static_samplers.push(StaticSampler { register, space: 0 });
        self
    }

    pub fn directly_indexed(mut self) -> Self {
        self.directly_indexed = true;
        self
    }

    /// Number of 32-bit values parameter `index` takes, if it holds
    /// constants.
    pub fn constant_count(&self, index: u32) -> Option<u32> {
        match self.parameters.get(index as usize)? {
            RootParameter::Constants { count, .. } => Some(*count),
            RootParameter::ShaderResourceView { .. } => None,
        }
    }
}

/// Everything needed to create a [`RaytracingPipeline`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PipelineDescriptor {
    pub ray_generation: String,
    pub hit_groups: Vec<HitGroup>,
    pub miss_shaders: Vec<String>,
    /// Compiled DXIL library exporting every entry point above.
    pub library: Vec<u8>,
    pub max_recursion_depth: u32,
    pub payload_size: u32,
    pub attribute_size: u32,
    pub root_signature: RootSignatureLayout,
}

impl PipelineDescriptor {
    pub fn validate(&self) -> Result<()> {
        if self.ray_generation.is_empty() || self.miss_shaders.iter().any(String::is_empty) {
            return Err(ContractViolation::EmptyExportName.into());
        }

        if self.hit_groups.is_empty() {
            return Err(ContractViolation::EmptyShaderTable("HitGroup").into());
        }

        if self.miss_shaders.is_empty() {
            return Err(ContractViolation::EmptyShaderTable("Miss").into());
        }

        let mut exports = FxHashSet::default();

        for group in &self.hit_groups {
            group.validate()?;

            if !exports.insert(group.export.as_str()) {
                return Err(ContractViolation::DuplicateHitGroupExport(group.export.clone()).into());
            }
        }

        Ok(())
    }
}

#[derive(Debug)]
pub struct RaytracingPipeline {
    root_signature: RootSignatureId,
    layout: RootSignatureLayout,
    state_object: StateObjectId,
    ray_generation: ShaderTable,
    miss: ShaderTable,
    hit_groups: ShaderTable,
}

impl RaytracingPipeline {
    pub fn new<D>(ctx: &mut GpuContext<D>, desc: &PipelineDescriptor) -> Result<Self>
    where
        D: Device,
    {
        desc.validate()?;

        let root_signature = ctx.device.create_root_signature(&desc.root_signature)?;

        let state_object = ctx.device.create_state_object(&StateObjectDesc {
            library: &desc.library,
            hit_groups: &desc.hit_groups,
            payload_size: desc.payload_size,
            attribute_size: desc.attribute_size,
            root_signature,
            max_recursion_depth: desc.max_recursion_depth,
        })?;

        let ray_generation = ShaderTable::build(
            &mut ctx.device,
            "RayGen",
            state_object,
            &[desc.ray_generation.as_str()],
        )?;

        let miss = ShaderTable::build(&mut ctx.device, "Miss", state_object, &desc.miss_shaders)?;

        let exports: Vec<_> = desc
            .hit_groups
            .iter()
            .map(|group| group.export.as_str())
            .collect();

        let hit_groups = ShaderTable::build(&mut ctx.device, "HitGroup", state_object, &exports)?;

        log::info!(
            "Created ray tracing pipeline; hit groups={}, miss shaders={}, recursion={}, record \
             stride={}",
            hit_groups.count(),
            miss.count(),
            desc.max_recursion_depth,
            hit_groups.stride(),
        );

        Ok(Self {
            root_signature,
            layout: desc.root_signature.clone(),
            state_object,
            ray_generation,
            miss,
            hit_groups,
        })
    }

    pub fn root_signature(&self) -> RootSignatureId {
        self.root_signature
    }

    pub fn layout(&self) -> &RootSignatureLayout {
        &self.layout
    }

    pub fn state_object(&self) -> StateObjectId {
        self.state_object
    }

    pub fn ray_generation_table(&self) -> &ShaderTable {
        &self.ray_generation
    }

    pub fn miss_table(&self) -> &ShaderTable {
        &self.miss
    }

    pub fn hit_group_table(&self) -> &ShaderTable {
        &self.hit_groups
    }

    /// Dispatch over a `width` x `height` grid using this pipeline's tables.
    pub fn dispatch_desc(&self, width: u32, height: u32) -> DispatchRaysDesc {
        DispatchRaysDesc {
            ray_generation: self.ray_generation.range(),
            miss: self.miss.strided_range(),
            hit_group: self.hit_groups.strided_range(),
            width,
            height,
            depth: 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::headless::HeadlessDevice;
    use crate::Error;

    fn descriptor() -> PipelineDescriptor {
        PipelineDescriptor {
            ray_generation: "RayGenMain".into(),
            hit_groups: vec![
                HitGroup::triangles("HitGroup", "ClosestMain"),
                HitGroup::procedural("HitGroupPrimitive", "ClosestMainPrimitive", "IntersectionMainSphere"),
                HitGroup::procedural(
                    "HitGroupPrimitiveTorus",
                    "ClosestMainPrimitive",
                    "IntersectionMainTorus",
                ),
            ],
            miss_shaders: vec!["MissMain".into(), "MissMainShadow".into()],
            library: Vec::new(),
            max_recursion_depth: 3,
            payload_size: 20,
            attribute_size: 12,
            root_signature: RootSignatureLayout::new()
                .constants(0, 53)
                .constants(1, 7)
                .shader_resource_view(0)
                .shader_resource_view(1)
                .static_sampler(0)
                .directly_indexed(),
        }
    }

    #[test]
    fn hit_group_imports_skip_empty_names() {
        let group = HitGroup {
            any_hit: Some(String::new()),
            ..HitGroup::procedural("A", "Closest", "Intersect")
        };

        assert_eq!(vec!["Closest", "Intersect"], group.imports().collect::<Vec<_>>());
    }

    #[test]
    fn intersection_is_only_legal_on_procedural_groups() {
        let mut desc = descriptor();

        desc.hit_groups[0].intersection = Some("IntersectionMainSphere".into());

        assert!(matches!(
            desc.validate(),
            Err(Error::Contract(ContractViolation::IntersectionOnTriangleHitGroup(export)))
                if export == "HitGroup"
        ));

        let mut desc = descriptor();

        desc.hit_groups[1].intersection = None;

        assert!(matches!(
            desc.validate(),
            Err(Error::Contract(ContractViolation::MissingIntersection(_)))
        ));
    }

    #[test]
    fn exports_must_be_unique_and_named() {
        let mut desc = descriptor();

        desc.hit_groups[2].export = "HitGroup".into();

        assert!(matches!(
            desc.validate(),
            Err(Error::Contract(ContractViolation::DuplicateHitGroupExport(_)))
        ));

        let mut desc = descriptor();

        desc.ray_generation.clear();

        assert!(matches!(
            desc.validate(),
            Err(Error::Contract(ContractViolation::EmptyExportName))
        ));
    }

    #[test]
    fn invalid_descriptor_creates_nothing() {
        let mut ctx = GpuContext::new(HeadlessDevice::new());
        let mut desc = descriptor();

        desc.hit_groups[0].intersection = Some("IntersectionMainSphere".into());

        assert!(RaytracingPipeline::new(&mut ctx, &desc).is_err());
        assert_eq!(0, ctx.device.allocations());
    }

    #[test]
    fn builds_three_tables() {
        let mut ctx = GpuContext::new(HeadlessDevice::new());
        let pipeline = RaytracingPipeline::new(&mut ctx, &descriptor()).unwrap();

        assert_eq!(1, pipeline.ray_generation_table().count());
        assert_eq!(2, pipeline.miss_table().count());
        assert_eq!(3, pipeline.hit_group_table().count());
        assert_eq!(Some(53), pipeline.layout().constant_count(0));
        assert_eq!(None, pipeline.layout().constant_count(2));
        assert_eq!(
            Some(3),
            ctx.device.max_recursion_depth(pipeline.state_object())
        );

        let dispatch = pipeline.dispatch_desc(640, 480);

        assert_eq!(32, dispatch.ray_generation.size);
        assert_eq!(64, dispatch.miss.size);
        assert_eq!(96, dispatch.hit_group.size);
        assert_eq!(32, dispatch.hit_group.stride);
        assert_eq!(1, dispatch.depth);
    }

    #[test]
    fn driver_failures_surface() {
        let mut ctx = GpuContext::new(HeadlessDevice::new());

        ctx.device
            .fail_root_signatures(Some("root parameter 2 overlaps".into()));

        assert!(matches!(
            RaytracingPipeline::new(&mut ctx, &descriptor()),
            Err(Error::RootSignatureSerialization(Some(_)))
        ));

        let mut ctx = GpuContext::new(HeadlessDevice::new());

        ctx.device.fail_state_objects(0x8007_0057);

        assert!(matches!(
            RaytracingPipeline::new(&mut ctx, &descriptor()),
            Err(Error::StateObjectCreation(0x8007_0057))
        ));
    }
}
