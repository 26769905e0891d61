//! Ownership root of a sample's assets and instances.
//!
//! Meshes and procedural primitives live in append-only registries; instances
//! live in a generational arena so a removed instance can never be confused
//! with whatever later reuses its slot.

use crate::blas::{BottomLevelStructure, Mesh, ProceduralPrimitive};
use crate::context::GpuContext;
use crate::device::Device;
use crate::geometry::AttributeSlots;
use crate::instance::GeometryInstance;
use crate::{ContractViolation, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MeshId(pub u32);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ProceduralId(pub u32);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AssetRef {
    Mesh(MeshId),
    Procedural(ProceduralId),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct InstanceId {
    index: u32,
    generation: u32,
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    instance: Option<GeometryInstance>,
}

/// What the TLAS needs to know about the asset behind an instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResolvedAsset {
    pub blas: BottomLevelStructure,
    pub slots: AttributeSlots,
    pub hit_group_index: u32,
}

#[derive(Debug, Default)]
pub struct Scene {
    meshes: Vec<Mesh>,
    procedurals: Vec<ProceduralPrimitive>,
    slots: Vec<Slot>,
    free: Vec<u32>,
}

impl Scene {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_mesh(&mut self, mesh: Mesh) -> MeshId {
        self.meshes.push(mesh);

        MeshId(self.meshes.len() as u32 - 1)
    }

    pub fn mesh(&self, id: MeshId) -> Option<&Mesh> {
        self.meshes.get(id.0 as usize)
    }

    pub fn mesh_mut(&mut self, id: MeshId) -> Option<&mut Mesh> {
        self.meshes.get_mut(id.0 as usize)
    }

    pub fn add_procedural(&mut self, primitive: ProceduralPrimitive) -> ProceduralId {
        self.procedurals.push(primitive);

        ProceduralId(self.procedurals.len() as u32 - 1)
    }

    pub fn procedural(&self, id: ProceduralId) -> Option<&ProceduralPrimitive> {
        self.procedurals.get(id.0 as usize)
    }

    pub fn procedural_mut(&mut self, id: ProceduralId) -> Option<&mut ProceduralPrimitive> {
        self.procedurals.get_mut(id.0 as usize)
    }

    /// Builds every asset's BLAS that is not built yet, blocking on each.
    pub fn build_blases<D>(&mut self, ctx: &mut GpuContext<D>) -> Result<()>
    where
        D: Device,
    {
        for mesh in &mut self.meshes {
            if mesh.blas().is_none() {
                mesh.build_blas(ctx)?;
            }
        }

        for primitive in &mut self.procedurals {
            if primitive.blas().is_none() {
                primitive.build_blas(ctx)?;
            }
        }

        Ok(())
    }

    pub fn add_instance(&mut self, instance: GeometryInstance) -> InstanceId {
        match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];

                slot.instance = Some(instance);

                InstanceId {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    instance: Some(instance),
                });

                InstanceId {
                    index: self.slots.len() as u32 - 1,
                    generation: 0,
                }
            }
        }
    }

    /// Removes the instance; its id (and any copy of it) goes stale.
    pub fn remove_instance(&mut self, id: InstanceId) -> Option<GeometryInstance> {
        let slot = self.slot_mut(id)?;
        let instance = slot.instance.take();

        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);

        instance
    }

    pub fn instance(&self, id: InstanceId) -> Option<&GeometryInstance> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)?
            .instance
            .as_ref()
    }

    pub fn instance_mut(&mut self, id: InstanceId) -> Option<&mut GeometryInstance> {
        self.slot_mut(id)?.instance.as_mut()
    }

    pub fn instance_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.instance.is_some())
            .count()
    }

    /// Looks up the built BLAS and shader-visible data of `asset`.
    pub fn resolve(&self, asset: AssetRef) -> Result<ResolvedAsset> {
        match asset {
            AssetRef::Mesh(id) => {
                let mesh = self.mesh(id).ok_or(ContractViolation::UnknownAsset)?;

                Ok(ResolvedAsset {
                    blas: *mesh
                        .blas()
                        .ok_or(ContractViolation::AccelerationStructureNotBuilt)?,
                    slots: mesh.geometry().attribute_slots(),
                    hit_group_index: 0,
                })
            }
            AssetRef::Procedural(id) => {
                let primitive = self.procedural(id).ok_or(ContractViolation::UnknownAsset)?;

                Ok(ResolvedAsset {
                    blas: *primitive
                        .blas()
                        .ok_or(ContractViolation::AccelerationStructureNotBuilt)?,
                    slots: AttributeSlots::default(),
                    hit_group_index: primitive.hit_group_index(),
                })
            }
        }
    }

    fn slot_mut(&mut self, id: InstanceId) -> Option<&mut Slot> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation && slot.instance.is_some())
    }
}

#[cfg(test)]
mod tests {
    use glam::Vec3;

    use super::*;
    use crate::geometry::GeometryBuffer;
    use crate::Error;

    fn instance() -> GeometryInstance {
        GeometryInstance::new(AssetRef::Mesh(MeshId(0)))
    }

    #[test]
    fn removed_ids_go_stale() {
        let mut scene = Scene::new();

        let a = scene.add_instance(instance());
        let b = scene.add_instance(instance().with_translation(Vec3::X));

        assert!(scene.remove_instance(a).is_some());
        assert!(scene.instance(a).is_none());
        assert!(scene.remove_instance(a).is_none());

        // The freed slot is reused under a new generation
        let c = scene.add_instance(instance().with_translation(Vec3::Y));

        assert_ne!(a, c);
        assert!(scene.instance(a).is_none());
        assert_eq!(Vec3::Y, scene.instance(c).unwrap().translation());
        assert_eq!(Vec3::X, scene.instance(b).unwrap().translation());
        assert_eq!(2, scene.instance_count());
    }

    #[test]
    fn resolving_requires_a_built_blas() {
        let mut scene = Scene::new();
        let mesh = scene.add_mesh(Mesh::new(GeometryBuffer::new("empty")));

        assert!(matches!(
            scene.resolve(AssetRef::Mesh(mesh)),
            Err(Error::Contract(ContractViolation::AccelerationStructureNotBuilt))
        ));

        assert!(matches!(
            scene.resolve(AssetRef::Procedural(ProceduralId(7))),
            Err(Error::Contract(ContractViolation::UnknownAsset))
        ));
    }
}
