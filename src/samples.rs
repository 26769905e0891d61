//! The five sample scenes and their per-frame bindings.

use std::fmt;
use std::path::Path;

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Quat, Vec2, Vec3, Vec4};

use crate::blas::{Aabb, AabbEntry, Mesh, ProceduralPrimitive};
use crate::camera::{Camera, CameraInput};
use crate::context::GpuContext;
use crate::device::{CommandListId, Device};
use crate::dispatch::{record_dispatch, Binding, RootConstants};
use crate::frame::RenderTarget;
use crate::geometry::GeometryBuffer;
use crate::instance::GeometryInstance;
use crate::pipeline::{HitGroup, PipelineDescriptor, RaytracingPipeline, RootSignatureLayout};
use crate::scene::{AssetRef, InstanceId, Scene};
use crate::tlas::{RecordLayout, TopLevelStructure, ABSENT};
use crate::{Error, Result};

const MAX_RECURSION: u32 = 3;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SampleKind {
    Basic,
    Lighting,
    Shadows,
    Reflections,
    Intersection,
}

impl SampleKind {
    pub const ALL: [SampleKind; 5] = [
        SampleKind::Basic,
        SampleKind::Lighting,
        SampleKind::Shadows,
        SampleKind::Reflections,
        SampleKind::Intersection,
    ];

    pub fn name(self) -> &'static str {
        match self {
            SampleKind::Basic => "Basic",
            SampleKind::Lighting => "Lighting",
            SampleKind::Shadows => "Shadows",
            SampleKind::Reflections => "Reflections",
            SampleKind::Intersection => "Intersection",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.name().eq_ignore_ascii_case(name))
    }

    /// Compiled DXIL library file name.
    pub fn library_file(self) -> String {
        format!("{}.cso", self.name())
    }

    pub fn load_library(self, dir: &Path) -> Result<Vec<u8>> {
        let path = dir.join(self.library_file());

        std::fs::read(&path).map_err(|source| Error::Io { path, source })
    }

    fn record_layout(self) -> RecordLayout {
        match self {
            SampleKind::Reflections | SampleKind::Intersection => RecordLayout::Reflective,
            _ => RecordLayout::Tinted,
        }
    }

    pub fn pipeline_descriptor(self, library: Vec<u8>) -> PipelineDescriptor {
        let lit = RootSignatureLayout::new()
            .constants(0, 20)
            .constants(1, DirectionalLight::CONSTANTS)
            .shader_resource_view(0)
            .shader_resource_view(1)
            .directly_indexed();

        let mut desc = PipelineDescriptor {
            ray_generation: "RayGenMain".into(),
            hit_groups: vec![HitGroup::triangles("HitGroup", "ClosestMain")],
            miss_shaders: vec!["MissMain".into()],
            library,
            max_recursion_depth: 1,
            payload_size: 16,
            attribute_size: 8,
            root_signature: lit,
        };

        match self {
            SampleKind::Basic => {
                desc.root_signature = RootSignatureLayout::new()
                    .constants(0, 1)
                    .shader_resource_view(0)
                    .directly_indexed();
            }
            SampleKind::Lighting => {}
            SampleKind::Shadows => {
                desc.miss_shaders.push("MissMainShadow".into());
                desc.max_recursion_depth = 2;
            }
            SampleKind::Reflections => {
                desc.miss_shaders.push("MissMainShadow".into());
                desc.max_recursion_depth = MAX_RECURSION;
                desc.payload_size = 20;
            }
            SampleKind::Intersection => {
                desc.hit_groups.extend([
                    HitGroup::procedural(
                        "HitGroupPrimitive",
                        "ClosestMainPrimitive",
                        "IntersectionMainSphere",
                    ),
                    HitGroup::procedural(
                        "HitGroupPrimitiveTorus",
                        "ClosestMainPrimitive",
                        "IntersectionMainTorus",
                    ),
                ]);
                desc.miss_shaders.push("MissMainShadow".into());
                desc.max_recursion_depth = MAX_RECURSION;
                desc.payload_size = 20;
                // Intersection shaders report a hit position, not barycentrics
                desc.attribute_size = 12;
                desc.root_signature = RootSignatureLayout::new()
                    .constants(0, 53)
                    .constants(1, DirectionalLight::CONSTANTS)
                    .shader_resource_view(0)
                    .shader_resource_view(1)
                    .shader_resource_view(2)
                    .static_sampler(0)
                    .directly_indexed();
            }
        }

        desc
    }
}

impl fmt::Display for SampleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct DirectionalLight {
    pub direction: [f32; 3],
    pub intensity: f32,
    pub color: [f32; 3],
}

impl DirectionalLight {
    pub const CONSTANTS: u32 = (std::mem::size_of::<DirectionalLight>() / 4) as u32;

    pub fn new(direction: Vec3) -> Self {
        Self {
            direction: direction.to_array(),
            intensity: 1.0,
            color: [1.0; 3],
        }
    }
}

/// A sample's scene, pipeline and per-frame state.
#[derive(Debug)]
pub struct Sample {
    kind: SampleKind,
    scene: Scene,
    tlas: TopLevelStructure,
    pipeline: RaytracingPipeline,
    camera: Camera,
    light: DirectionalLight,
    animated: Option<InstanceId>,
    procedural_transform: Mat4,
    time: f32,
}

impl Sample {
    pub fn new<D>(ctx: &mut GpuContext<D>, kind: SampleKind, library: Vec<u8>) -> Result<Self>
    where
        D: Device,
    {
        log::info!("Initializing sample `{kind}`");

        let mut scene = Scene::new();
        let mut tlas = TopLevelStructure::new("TLAS", kind.record_layout());
        let mut animated = None;

        let mut camera = Camera::new(Vec3::new(0.0, -7.0, 6.0), 90.0, -30.0);
        let mut light = DirectionalLight::new(Vec3::new(0.0, 0.0, -1.0));

        match kind {
            SampleKind::Basic => {
                let mesh = scene.add_mesh(Mesh::new(triangle(ctx)?));
                let id = scene.add_instance(GeometryInstance::new(AssetRef::Mesh(mesh)));

                tlas.add_instance(&mut scene, id);
            }
            SampleKind::Lighting => {
                let mesh = scene.add_mesh(Mesh::new(cube(ctx)?));
                let id = scene.add_instance(GeometryInstance::new(AssetRef::Mesh(mesh)));

                tlas.add_instance(&mut scene, id);

                camera = Camera::new(Vec3::new(0.0, -1.0, 0.0), 90.0, 0.0);
                light = DirectionalLight::new(Vec3::new(0.3, 0.5, -0.2));
            }
            SampleKind::Shadows => {
                let mesh = AssetRef::Mesh(scene.add_mesh(Mesh::new(cube(ctx)?)));

                for instance in [
                    GeometryInstance::new(mesh).with_translation(Vec3::new(0.0, 0.0, 3.0)),
                    GeometryInstance::new(mesh).with_scale(Vec3::new(5.0, 5.0, 0.5)),
                ] {
                    let id = scene.add_instance(instance);
                    tlas.add_instance(&mut scene, id);
                }
            }
            SampleKind::Reflections => {
                let mesh = AssetRef::Mesh(scene.add_mesh(Mesh::new(cube(ctx)?)));

                let cube = scene.add_instance(
                    GeometryInstance::new(mesh)
                        .with_translation(Vec3::new(0.0, 0.0, 1.5))
                        .with_color(Vec4::new(0.5, 1.0, 0.5, 1.0)),
                );
                let floor = scene.add_instance(
                    GeometryInstance::new(mesh)
                        .with_scale(Vec3::new(5.0, 5.0, 0.5))
                        .with_reflectance(0.5),
                );

                tlas.add_instance(&mut scene, cube);
                tlas.add_instance(&mut scene, floor);

                animated = Some(cube);
                light = DirectionalLight::new(Vec3::new(-0.25, -0.25, -0.5));
            }
            SampleKind::Intersection => {
                let mesh = AssetRef::Mesh(scene.add_mesh(Mesh::new(cube(ctx)?)));

                let mut sphere = ProceduralPrimitive::new("sphere");
                sphere.add_entry(unit_box(Vec3::splat(1.0)));
                sphere.set_hit_group_index(1);

                let mut torus = ProceduralPrimitive::new("torus");
                torus.add_entry(unit_box(Vec3::splat(2.0)));
                torus.set_hit_group_index(2);

                let sphere = AssetRef::Procedural(scene.add_procedural(sphere));
                let torus = AssetRef::Procedural(scene.add_procedural(torus));

                for instance in [
                    GeometryInstance::new(mesh)
                        .with_translation(Vec3::new(0.0, 0.0, 1.5))
                        .with_color(Vec4::new(0.5, 1.0, 0.5, 1.0)),
                    GeometryInstance::new(mesh)
                        .with_scale(Vec3::new(5.0, 5.0, 0.5))
                        .with_color(Vec4::new(1.0, 0.0, 1.0, 1.0))
                        .with_reflectance(0.1),
                    GeometryInstance::new(sphere),
                    GeometryInstance::new(torus),
                ] {
                    let id = scene.add_instance(instance);
                    tlas.add_instance(&mut scene, id);
                }

                light = DirectionalLight::new(Vec3::new(-0.25, -0.25, -0.5));
            }
        }

        scene.build_blases(ctx)?;
        tlas.build(ctx, &mut scene)?;

        let pipeline = RaytracingPipeline::new(ctx, &kind.pipeline_descriptor(library))?;

        Ok(Self {
            kind,
            scene,
            tlas,
            pipeline,
            camera,
            light,
            animated,
            procedural_transform: Mat4::from_translation(Vec3::splat(2.5)),
            time: 0.0,
        })
    }

    pub fn kind(&self) -> SampleKind {
        self.kind
    }

    pub fn scene(&self) -> &Scene {
        &self.scene
    }

    pub fn tlas(&self) -> &TopLevelStructure {
        &self.tlas
    }

    pub fn pipeline(&self) -> &RaytracingPipeline {
        &self.pipeline
    }

    pub fn camera(&self) -> &Camera {
        &self.camera
    }

    pub fn update(&mut self, input: &CameraInput, delta_time: f32) {
        self.camera.update(input, delta_time);
        self.time += delta_time;

        if let Some(instance) = self
            .animated
            .and_then(|id| self.scene.instance_mut(id))
        {
            instance.set_rotation(Quat::from_rotation_z(self.time));
        }
    }

    /// Records this frame's TLAS refresh (if anything moved) and dispatch.
    pub fn record<D>(
        &mut self,
        ctx: &mut GpuContext<D>,
        list: CommandListId,
        target: &RenderTarget,
    ) -> Result<()>
    where
        D: Device,
    {
        if self.animated.is_some() {
            self.tlas.build_deferred(ctx, &mut self.scene, list)?;
        }

        let bindings = self.bindings(&ctx.device, target)?;

        record_dispatch(
            &mut ctx.device,
            list,
            &self.pipeline,
            &bindings,
            target.width(),
            target.height(),
        )
    }

    /// Root parameter values in signature order.
    fn bindings<D>(&self, device: &D, target: &RenderTarget) -> Result<Vec<Binding>>
    where
        D: Device,
    {
        let bvh = Binding::ShaderResourceView(self.tlas.address(device)?);

        if self.kind == SampleKind::Basic {
            let mut core = RootConstants::new();
            core.push_u32(target.uav());

            return Ok(vec![Binding::Constants(core), bvh]);
        }

        let inverse_view_projection = self
            .camera
            .inverse_view_projection(target.aspect_ratio());

        let mut core = RootConstants::new();
        core.push_mat4(&inverse_view_projection);

        if self.kind == SampleKind::Intersection {
            core.push_mat4(&self.procedural_transform)
                .push_mat4(&self.procedural_transform.inverse());
        }

        core.push_vec3(self.camera.position).push_u32(target.uav());

        if self.kind == SampleKind::Intersection {
            // No sky texture is loaded; the shader falls back to its miss color
            core.push_u32(ABSENT);
        }

        let mut light = RootConstants::new();
        light.push_pod(&self.light);

        let mut bindings = vec![
            Binding::Constants(core),
            Binding::Constants(light),
            Binding::ShaderResourceView(self.tlas.geometry_table_address(device)?),
            bvh,
        ];

        // Procedural hits look up their hit group per instance
        if self.kind == SampleKind::Intersection {
            bindings.push(Binding::ShaderResourceView(
                self.tlas.hit_group_table_address(device)?,
            ));
        }

        Ok(bindings)
    }
}

fn unit_box(min: Vec3) -> AabbEntry {
    AabbEntry::new(Aabb::new(min, min + Vec3::ONE), min + Vec3::splat(0.5))
}

fn triangle<D>(ctx: &mut GpuContext<D>) -> Result<GeometryBuffer>
where
    D: Device,
{
    let mut geometry = GeometryBuffer::new("triangle");

    geometry.set_positions(
        ctx,
        &[
            Vec3::new(0.0, -0.7, 1.0),
            Vec3::new(-0.7, 0.7, 1.0),
            Vec3::new(0.7, 0.7, 1.0),
        ],
    )?;
    geometry.set_indices(ctx, &[0u16, 1, 2])?;

    Ok(geometry)
}

/// Unit cube with per-face normals, 24 vertices and 36 indices.
fn cube<D>(ctx: &mut GpuContext<D>) -> Result<GeometryBuffer>
where
    D: Device,
{
    let faces = [
        (Vec3::Z, [(-1.0, -1.0, 1.0), (-1.0, 1.0, 1.0), (1.0, 1.0, 1.0), (1.0, -1.0, 1.0)]),
        (-Vec3::Z, [(1.0, -1.0, -1.0), (1.0, 1.0, -1.0), (-1.0, 1.0, -1.0), (-1.0, -1.0, -1.0)]),
        (-Vec3::X, [(-1.0, -1.0, -1.0), (-1.0, 1.0, -1.0), (-1.0, 1.0, 1.0), (-1.0, -1.0, 1.0)]),
        (Vec3::X, [(1.0, -1.0, 1.0), (1.0, 1.0, 1.0), (1.0, 1.0, -1.0), (1.0, -1.0, -1.0)]),
        (Vec3::Y, [(-1.0, 1.0, 1.0), (-1.0, 1.0, -1.0), (1.0, 1.0, -1.0), (1.0, 1.0, 1.0)]),
        (-Vec3::Y, [(-1.0, -1.0, -1.0), (-1.0, -1.0, 1.0), (1.0, -1.0, 1.0), (1.0, -1.0, -1.0)]),
    ];

    let mut positions = Vec::with_capacity(24);
    let mut normals = Vec::with_capacity(24);
    let mut uv0 = Vec::with_capacity(24);
    let mut indices = Vec::with_capacity(36);

    for (face, (normal, corners)) in faces.into_iter().enumerate() {
        let base = (face * 4) as u32;

        for (corner, (x, y, z)) in corners.into_iter().enumerate() {
            positions.push(Vec3::new(x, y, z) * 0.5);
            normals.push(normal);
            uv0.push(Vec2::new((corner / 2) as f32, ((corner + 1) / 2 % 2) as f32));
        }

        indices.extend([0, 2, 1, 0, 3, 2].map(|index| base + index));
    }

    let mut geometry = GeometryBuffer::new("cube");

    geometry.set_positions(ctx, &positions)?;
    geometry.set_normals(ctx, &normals)?;
    geometry.set_uv0(ctx, &uv0)?;
    geometry.set_indices(ctx, &indices)?;

    Ok(geometry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::headless::HeadlessDevice;
    use crate::device::Command;
    use crate::frame::FrameRing;

    fn sample(kind: SampleKind) -> (GpuContext<HeadlessDevice>, Sample) {
        let mut ctx = GpuContext::new(HeadlessDevice::new());
        let sample = Sample::new(&mut ctx, kind, Vec::new()).unwrap();

        (ctx, sample)
    }

    #[test]
    fn names_round_trip() {
        for kind in SampleKind::ALL {
            assert_eq!(Some(kind), SampleKind::from_name(kind.name()));
        }

        assert_eq!(Some(SampleKind::Shadows), SampleKind::from_name("shadows"));
        assert_eq!(None, SampleKind::from_name("Refraction"));
        assert_eq!("Intersection.cso", SampleKind::Intersection.library_file());
    }

    #[test]
    fn light_is_seven_constants() {
        assert_eq!(7, DirectionalLight::CONSTANTS);
    }

    #[test]
    fn every_sample_records_a_dispatch() {
        for kind in SampleKind::ALL {
            let (mut ctx, mut sample) = sample(kind);
            let target = RenderTarget::new(&mut ctx, 320, 200).unwrap();
            let list = ctx.device.create_command_list().unwrap();

            sample.update(&CameraInput::default(), 1.0 / 60.0);
            sample.record(&mut ctx, list, &target).unwrap();

            let commands = ctx.device.commands(list);

            assert!(
                matches!(commands.last(), Some(Command::DispatchRays(desc)) if desc.width == 320),
                "{kind}"
            );
        }
    }

    #[test]
    fn intersection_scene_matches_hit_groups() {
        let (ctx, sample) = sample(SampleKind::Intersection);

        assert_eq!(&[0, 0, 1, 2], sample.tlas().hit_group_indices());
        assert_eq!(
            Some(&[0u8, 0, 0, 0, 0, 0, 0, 0, 1, 0, 0, 0, 2, 0, 0, 0][..]),
            ctx.device
                .buffer_data(sample.tlas().hit_group_table_buffer().unwrap())
        );
        assert_eq!(4, sample.tlas().geometry_table_rows());
        assert_eq!(3, sample.pipeline().hit_group_table().count());
        assert_eq!(
            Some(MAX_RECURSION),
            ctx.device.max_recursion_depth(sample.pipeline().state_object())
        );
    }

    #[test]
    fn reflections_rebuild_every_frame_without_resubmitting() {
        let (mut ctx, mut sample) = sample(SampleKind::Reflections);
        let target = RenderTarget::new(&mut ctx, 64, 64).unwrap();
        let mut ring = FrameRing::new(&mut ctx.device).unwrap();
        let setup_submissions = ctx.device.submissions().len();

        for _ in 0..3 {
            let list = ring.begin(&mut ctx.device).unwrap();

            sample.update(&CameraInput::default(), 0.1);
            sample.record(&mut ctx, list, &target).unwrap();

            let builds = ctx
                .device
                .commands(list)
                .iter()
                .filter(|command| command.is_acceleration_structure_build())
                .count();

            assert_eq!(1, builds);

            ring.end(&mut ctx.device).unwrap();
        }

        assert_eq!(setup_submissions + 3, ctx.device.submissions().len());
    }

    #[test]
    fn static_samples_do_not_rebuild() {
        let (mut ctx, mut sample) = sample(SampleKind::Shadows);
        let target = RenderTarget::new(&mut ctx, 64, 64).unwrap();
        let list = ctx.device.create_command_list().unwrap();

        sample.update(&CameraInput::default(), 0.1);
        sample.record(&mut ctx, list, &target).unwrap();

        assert!(!ctx
            .device
            .commands(list)
            .iter()
            .any(Command::is_acceleration_structure_build));
    }
}
