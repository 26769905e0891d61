use glam::{Mat4, Quat, Vec3, Vec4};

use crate::scene::AssetRef;

/// A placed reference to one asset's BLAS.
///
/// Transform setters mark the instance dirty so the next deferred TLAS build
/// picks the change up; tint and reflectance only feed the attribute table.
#[derive(Clone, Debug, PartialEq)]
pub struct GeometryInstance {
    asset: AssetRef,
    translation: Vec3,
    rotation: Quat,
    scale: Vec3,
    color: Vec4,
    reflectance: f32,
    dirty: bool,
}

impl GeometryInstance {
    pub fn new(asset: AssetRef) -> Self {
        Self {
            asset,
            translation: Vec3::ZERO,
            rotation: Quat::IDENTITY,
            scale: Vec3::ONE,
            color: Vec4::ONE,
            reflectance: 0.0,
            dirty: true,
        }
    }

    pub fn with_translation(mut self, translation: Vec3) -> Self {
        self.set_translation(translation);
        self
    }

    pub fn with_rotation(mut self, rotation: Quat) -> Self {
        self.set_rotation(rotation);
        self
    }

    pub fn with_scale(mut self, scale: Vec3) -> Self {
        self.set_scale(scale);
        self
    }

    pub fn with_color(mut self, color: Vec4) -> Self {
        self.color = color;
        self
    }

    pub fn with_reflectance(mut self, reflectance: f32) -> Self {
        self.reflectance = reflectance;
        self
    }

    pub fn asset(&self) -> AssetRef {
        self.asset
    }

    pub fn translation(&self) -> Vec3 {
        self.translation
    }

    pub fn set_translation(&mut self, translation: Vec3) {
        self.translation = translation;
        self.dirty = true;
    }

    pub fn rotation(&self) -> Quat {
        self.rotation
    }

    pub fn set_rotation(&mut self, rotation: Quat) {
        self.rotation = rotation;
        self.dirty = true;
    }

    pub fn scale(&self) -> Vec3 {
        self.scale
    }

    pub fn set_scale(&mut self, scale: Vec3) {
        self.scale = scale;
        self.dirty = true;
    }

    pub fn color(&self) -> Vec4 {
        self.color
    }

    pub fn set_color(&mut self, color: Vec4) {
        self.color = color;
    }

    pub fn reflectance(&self) -> f32 {
        self.reflectance
    }

    pub fn set_reflectance(&mut self, reflectance: f32) {
        self.reflectance = reflectance;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub(crate) fn clear_dirty(&mut self) {
        self.dirty = false;
    }

    /// `translation * rotation * scale`: scale applies first.
    pub fn matrix(&self) -> Mat4 {
        Mat4::from_scale_rotation_translation(self.scale, self.rotation, self.translation)
    }

    /// Top three rows of [`Self::matrix`], the layout instance descriptors
    /// expect.
    pub fn to_row_major_3x4(&self) -> [[f32; 4]; 3] {
        let transposed = self.matrix().transpose();

        [
            transposed.x_axis.to_array(),
            transposed.y_axis.to_array(),
            transposed.z_axis.to_array(),
        ]
    }
}
