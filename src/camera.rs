//! Free-flying camera.
//!
//! Mouse deltas steer yaw and pitch; the basis vectors handed to the shader
//! are rebuilt from those angles every frame. Vertical movement is
//! world-axis, not view-axis, so looking down and holding forward still
//! travels horizontally at full speed.

use glam::Vec3;

const DEFAULT_FOV_DEGREES: f32 = 90.0;
const DEFAULT_MOVE_SPEED: f32 = 0.075;
const DEFAULT_SENSITIVITY: f32 = 0.002;

// Just shy of straight up, so forward never collapses onto the world up
// axis and the right vector stays well defined.
const PITCH_LIMIT: f32 = std::f32::consts::FRAC_PI_2 - 1e-3;

/// Held-key state sampled once per frame.
#[derive(Debug, Default, Clone, Copy)]
pub struct MoveInput {
    pub forward: bool,
    pub back: bool,
    pub left: bool,
    pub right: bool,
    pub up: bool,
    pub down: bool,
}

#[derive(Debug, Clone)]
pub struct FlyCamera {
    pub position: Vec3,
    yaw: f32,
    pitch: f32,
    fov_degrees: f32,
    move_speed: f32,
    sensitivity: f32,
}

impl Default for FlyCamera {
    fn default() -> Self {
        Self {
            position: Vec3::new(0.5, 0.5, -2.0),
            yaw: 0.0,
            pitch: 0.0,
            fov_degrees: DEFAULT_FOV_DEGREES,
            move_speed: DEFAULT_MOVE_SPEED,
            sensitivity: DEFAULT_SENSITIVITY,
        }
    }
}

impl FlyCamera {
    /// Applies a relative mouse motion.
    pub fn look(&mut self, dx: f32, dy: f32) {
        self.yaw -= dx * self.sensitivity;
        self.pitch = (self.pitch + dy * self.sensitivity).clamp(-PITCH_LIMIT, PITCH_LIMIT);
    }

    /// View basis: forward from yaw/pitch, right and up completed by cross
    /// products against the world up axis.
    pub fn basis(&self) -> (Vec3, Vec3, Vec3) {
        let forward = Vec3::new(
            self.pitch.cos() * self.yaw.sin(),
            self.pitch.sin(),
            self.pitch.cos() * self.yaw.cos(),
        )
        .normalize();
        let right = forward.cross(Vec3::Y).normalize();
        let up = right.cross(forward);
        (forward, right, up)
    }

    /// Advances one frame of movement from the held keys.
    pub fn step(&mut self, input: MoveInput) {
        let (forward, right, _) = self.basis();
        let mut delta = Vec3::ZERO;
        if input.forward {
            delta += forward;
        }
        if input.back {
            delta -= forward;
        }
        if input.left {
            delta -= right;
        }
        if input.right {
            delta += right;
        }
        if input.up {
            delta -= Vec3::Y;
        }
        if input.down {
            delta += Vec3::Y;
        }
        self.position += delta * self.move_speed;
    }

    pub fn adjust_fov(&mut self, delta_degrees: f32) {
        self.fov_degrees = (self.fov_degrees + delta_degrees).clamp(10.0, 170.0);
    }

    pub fn reset_fov(&mut self) {
        self.fov_degrees = DEFAULT_FOV_DEGREES;
    }

    pub fn fov_degrees(&self) -> f32 {
        self.fov_degrees
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: Vec3, b: Vec3) {
        assert!((a - b).length() < 1e-5, "{a} != {b}");
    }

    #[test]
    fn rest_basis_looks_down_positive_z() {
        let cam = FlyCamera::default();
        let (forward, right, up) = cam.basis();
        close(forward, Vec3::Z);
        close(right, Vec3::NEG_X);
        close(up, Vec3::Y);
    }

    #[test]
    fn basis_stays_orthonormal_under_look() {
        let mut cam = FlyCamera::default();
        cam.look(173.0, -321.0);
        cam.look(-42.0, 515.0);
        let (forward, right, up) = cam.basis();
        for v in [forward, right, up] {
            assert!((v.length() - 1.0).abs() < 1e-5);
        }
        assert!(forward.dot(right).abs() < 1e-5);
        assert!(forward.dot(up).abs() < 1e-5);
        assert!(right.dot(up).abs() < 1e-5);
    }

    #[test]
    fn pitch_is_clamped_short_of_vertical() {
        let mut cam = FlyCamera::default();
        cam.look(0.0, 1e6);
        let (forward, right, _) = cam.basis();
        assert!(forward.y < 1.0);
        assert!(right.length() > 0.9, "right must not collapse at the pole");
    }

    #[test]
    fn vertical_movement_ignores_view_pitch() {
        let mut cam = FlyCamera::default();
        cam.look(0.0, 400.0);
        let start = cam.position;
        cam.step(MoveInput {
            up: true,
            ..Default::default()
        });
        let moved = cam.position - start;
        assert!(moved.y < 0.0);
        assert_eq!(moved.x, 0.0);
        assert_eq!(moved.z, 0.0);
    }

    #[test]
    fn fov_clamps_and_resets() {
        let mut cam = FlyCamera::default();
        cam.adjust_fov(1000.0);
        assert_eq!(cam.fov_degrees(), 170.0);
        cam.reset_fov();
        assert_eq!(cam.fov_degrees(), DEFAULT_FOV_DEGREES);
    }

    #[test]
    fn opposing_keys_cancel() {
        let mut cam = FlyCamera::default();
        let start = cam.position;
        cam.step(MoveInput {
            forward: true,
            back: true,
            left: true,
            right: true,
            ..Default::default()
        });
        close(cam.position, start);
    }
}
