use glam::{Mat4, Vec3};

const UP: Vec3 = Vec3::Z;
const ROTATE_SPEED: f32 = 15.0;
const PITCH_LIMIT: f32 = 89.0;

/// Keys held during the current frame.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CameraInput {
    pub forward: bool,
    pub back: bool,
    pub left: bool,
    pub right: bool,
    pub up: bool,
    pub down: bool,
    pub pitch_up: bool,
    pub pitch_down: bool,
    pub yaw_left: bool,
    pub yaw_right: bool,
}

/// Z-up fly camera; angles are in degrees.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Camera {
    pub position: Vec3,
    pub yaw: f32,
    pub pitch: f32,
    pub fov_y: f32,
    pub near: f32,
    pub far: f32,
}

impl Camera {
    pub fn new(position: Vec3, yaw: f32, pitch: f32) -> Self {
        Self {
            position,
            yaw,
            pitch,
            fov_y: 55.0,
            near: 0.01,
            far: 100.0,
        }
    }

    pub fn forward(&self) -> Vec3 {
        let (yaw, pitch) = (self.yaw.to_radians(), self.pitch.to_radians());

        Vec3::new(yaw.cos() * pitch.cos(), yaw.sin() * pitch.cos(), pitch.sin()).normalize()
    }

    pub fn update(&mut self, input: &CameraInput, delta_time: f32) {
        let forward = self.forward();
        let right = forward.cross(UP);

        let mut motion = Vec3::ZERO;

        for (held, direction) in [
            (input.forward, forward),
            (input.back, -forward),
            (input.right, right),
            (input.left, -right),
            (input.up, UP),
            (input.down, -UP),
        ] {
            if held {
                motion += direction;
            }
        }

        self.position += motion * delta_time;

        let rotation = delta_time * ROTATE_SPEED;

        if input.pitch_up {
            self.pitch = (self.pitch + rotation).min(PITCH_LIMIT);
        }

        if input.pitch_down {
            self.pitch = (self.pitch - rotation).max(-PITCH_LIMIT);
        }

        if input.yaw_left {
            self.yaw += rotation;
        }

        if input.yaw_right {
            self.yaw -= rotation;
        }
    }

    pub fn view(&self) -> Mat4 {
        Mat4::look_at_rh(self.position, self.position + self.forward(), UP)
    }

    pub fn projection(&self, aspect_ratio: f32) -> Mat4 {
        Mat4::perspective_rh(self.fov_y.to_radians(), aspect_ratio, self.near, self.far)
    }

    pub fn inverse_view_projection(&self, aspect_ratio: f32) -> Mat4 {
        (self.projection(aspect_ratio) * self.view()).inverse()
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;
    use glam::Vec4;

    use super::*;

    #[test]
    fn yaw_90_looks_along_y() {
        let forward = Camera::new(Vec3::ZERO, 90.0, 0.0).forward();

        assert_abs_diff_eq!(0.0, forward.x, epsilon = 1e-6);
        assert_abs_diff_eq!(1.0, forward.y, epsilon = 1e-6);
        assert_abs_diff_eq!(0.0, forward.z, epsilon = 1e-6);
    }

    #[test]
    fn pitch_is_clamped() {
        let mut camera = Camera::new(Vec3::ZERO, 90.0, 88.0);
        let input = CameraInput {
            pitch_up: true,
            ..Default::default()
        };

        camera.update(&input, 1.0);

        assert_eq!(PITCH_LIMIT, camera.pitch);
    }

    #[test]
    fn moves_along_forward() {
        let mut camera = Camera::new(Vec3::new(0.0, -7.0, 6.0), 90.0, 0.0);
        let input = CameraInput {
            forward: true,
            ..Default::default()
        };

        camera.update(&input, 0.5);

        assert_abs_diff_eq!(-6.5, camera.position.y, epsilon = 1e-5);
    }

    #[test]
    fn center_ray_unprojects_in_front() {
        let camera = Camera::new(Vec3::new(0.0, -1.0, 0.0), 90.0, 0.0);
        let inverse = camera.inverse_view_projection(16.0 / 9.0);

        let far = inverse * Vec4::new(0.0, 0.0, 1.0, 1.0);
        let far = far.truncate() / far.w;

        // Screen center at the far plane sits straight ahead
        assert_abs_diff_eq!(0.0, far.x, epsilon = 1e-3);
        assert!(far.y > camera.position.y);
        assert_abs_diff_eq!(0.0, far.z, epsilon = 1e-3);
    }
}
