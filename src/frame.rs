//! Per-frame data shared with render systems.
//!
//! [`FrameInfo`] is what a render system receives for every frame: which frame-in-flight slot
//! it is drawing into, the command buffer being recorded and the slot's global descriptor
//! set. [`GlobalUbo`] is the bit-exact contents of the global uniform buffer bound at set 0,
//! binding 0.

use ash::vk;
use glam::{Mat4, Vec3, Vec4};

/// Capacity of each light array in [`GlobalUbo`].
pub const MAX_LIGHTS: usize = 10;

/// Everything a render system may use while recording one frame.
#[derive(Clone, Copy, Debug)]
pub struct FrameInfo<'a> {
    pub frame_index: usize,
    pub delta_time: f32,
    pub command_buffer: vk::CommandBuffer,
    pub camera: &'a Camera,
    pub global_descriptor_set: vk::DescriptorSet,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct PointLight {
    /// World position, `w = 1`.
    pub position: Vec4,
    /// Linear color in `xyz`, intensity in `w`.
    pub color: Vec4,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct DirectionalLight {
    /// Direction the light travels, `w = 0`.
    pub direction: Vec4,
    /// Linear color in `xyz`, intensity in `w`.
    pub color: Vec4,
}

/// A light as the scene describes it, before packing.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum LightSource {
    Point {
        position: Vec3,
        color: Vec3,
        intensity: f32,
    },
    Directional {
        direction: Vec3,
        color: Vec3,
        intensity: f32,
    },
}

/// The global uniform buffer, laid out for std140.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct GlobalUbo {
    pub view: Mat4,
    pub projection: Mat4,
    pub inverse_view: Mat4,
    pub ambient_light_color: Vec4,
    pub point_lights: [PointLight; MAX_LIGHTS],
    pub directional_lights: [DirectionalLight; MAX_LIGHTS],
    pub num_point_lights: i32,
    pub num_directional_lights: i32,
    _padding: [i32; 2],
}

impl Default for GlobalUbo {
    fn default() -> Self {
        Self {
            view: Mat4::IDENTITY,
            projection: Mat4::IDENTITY,
            inverse_view: Mat4::IDENTITY,
            ambient_light_color: Vec4::new(0.6, 0.6, 1.0, 0.02),
            point_lights: [PointLight::default(); MAX_LIGHTS],
            directional_lights: [DirectionalLight::default(); MAX_LIGHTS],
            num_point_lights: 0,
            num_directional_lights: 0,
            _padding: [0; 2],
        }
    }
}

impl GlobalUbo {
    /// Copies the camera matrices.
    pub fn set_camera(&mut self, camera: &Camera) {
        self.view = camera.view();
        self.projection = camera.projection();
        self.inverse_view = camera.inverse_view();
    }

    /// Replaces both light arrays with `lights`, in iteration order.
    ///
    /// The first [`MAX_LIGHTS`] lights of each kind are kept. Returns how many were dropped.
    pub fn set_lights(&mut self, lights: impl IntoIterator<Item = LightSource>) -> usize {
        let mut points = 0;
        let mut directionals = 0;
        let mut dropped = 0;
        for light in lights {
            match light {
                LightSource::Point {
                    position,
                    color,
                    intensity,
                } => {
                    let Some(slot) = self.point_lights.get_mut(points) else {
                        dropped += 1;
                        continue;
                    };
                    *slot = PointLight {
                        position: position.extend(1.0),
                        color: color.extend(intensity),
                    };
                    points += 1;
                }
                LightSource::Directional {
                    direction,
                    color,
                    intensity,
                } => {
                    let Some(slot) = self.directional_lights.get_mut(directionals) else {
                        dropped += 1;
                        continue;
                    };
                    *slot = DirectionalLight {
                        direction: direction.extend(0.0),
                        color: color.extend(intensity),
                    };
                    directionals += 1;
                }
            }
        }
        self.point_lights[points..].fill(PointLight::default());
        self.directional_lights[directionals..].fill(DirectionalLight::default());
        self.num_point_lights = points as i32;
        self.num_directional_lights = directionals as i32;
        if dropped > 0 {
            tracing::warn!(dropped, max = MAX_LIGHTS, "Too many lights; extra lights ignored");
        }
        dropped
    }
}

/// Default camera up vector. Vulkan clip space has `y` pointing down.
pub const DEFAULT_UP: Vec3 = Vec3::new(0.0, -1.0, 0.0);

/// Projection and view matrices for one viewpoint.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Camera {
    projection: Mat4,
    view: Mat4,
    inverse_view: Mat4,
}

impl Default for Camera {
    fn default() -> Self {
        Self {
            projection: Mat4::IDENTITY,
            view: Mat4::IDENTITY,
            inverse_view: Mat4::IDENTITY,
        }
    }
}

impl Camera {
    /// Maps the box to Vulkan clip space with depth in `[0, 1]`.
    pub fn set_orthographic_projection(
        &mut self,
        left: f32,
        right: f32,
        top: f32,
        bottom: f32,
        near: f32,
        far: f32,
    ) {
        self.projection = Mat4::from_cols(
            Vec4::new(2.0 / (right - left), 0.0, 0.0, 0.0),
            Vec4::new(0.0, 2.0 / (bottom - top), 0.0, 0.0),
            Vec4::new(0.0, 0.0, 1.0 / (far - near), 0.0),
            Vec4::new(
                -(right + left) / (right - left),
                -(bottom + top) / (bottom - top),
                -near / (far - near),
                1.0,
            ),
        );
    }

    /// Left-handed perspective with depth in `[0, 1]`.
    ///
    /// # Panics
    ///
    /// Panics if `aspect` is zero.
    pub fn set_perspective_projection(&mut self, fovy: f32, aspect: f32, near: f32, far: f32) {
        assert!(aspect.abs() > f32::EPSILON, "aspect ratio is too small");
        let tan_half_fovy = (fovy / 2.0).tan();
        self.projection = Mat4::from_cols(
            Vec4::new(1.0 / (aspect * tan_half_fovy), 0.0, 0.0, 0.0),
            Vec4::new(0.0, 1.0 / tan_half_fovy, 0.0, 0.0),
            Vec4::new(0.0, 0.0, far / (far - near), 1.0),
            Vec4::new(0.0, 0.0, -(far * near) / (far - near), 0.0),
        );
    }

    /// Looks from `position` along `direction`.
    pub fn set_view_direction(&mut self, position: Vec3, direction: Vec3, up: Vec3) {
        let w = direction.normalize();
        let u = w.cross(up).normalize();
        let v = w.cross(u);
        self.set_basis(position, u, v, w);
    }

    /// Looks from `position` at `target`.
    pub fn set_view_target(&mut self, position: Vec3, target: Vec3, up: Vec3) {
        self.set_view_direction(position, target - position, up);
    }

    /// Orients the camera by Tait-Bryan angles applied in Y, X, Z order.
    pub fn set_view_yxz(&mut self, position: Vec3, rotation: Vec3) {
        let (s3, c3) = rotation.z.sin_cos();
        let (s2, c2) = rotation.x.sin_cos();
        let (s1, c1) = rotation.y.sin_cos();
        let u = Vec3::new(c1 * c3 + s1 * s2 * s3, c2 * s3, c1 * s2 * s3 - c3 * s1);
        let v = Vec3::new(c3 * s1 * s2 - c1 * s3, c2 * c3, c1 * c3 * s2 + s1 * s3);
        let w = Vec3::new(c2 * s1, -s2, c1 * c2);
        self.set_basis(position, u, v, w);
    }

    fn set_basis(&mut self, position: Vec3, u: Vec3, v: Vec3, w: Vec3) {
        self.view = Mat4::from_cols(
            Vec4::new(u.x, v.x, w.x, 0.0),
            Vec4::new(u.y, v.y, w.y, 0.0),
            Vec4::new(u.z, v.z, w.z, 0.0),
            Vec4::new(-u.dot(position), -v.dot(position), -w.dot(position), 1.0),
        );
        self.inverse_view = Mat4::from_cols(
            u.extend(0.0),
            v.extend(0.0),
            w.extend(0.0),
            position.extend(1.0),
        );
    }

    pub fn projection(&self) -> Mat4 {
        self.projection
    }
    pub fn view(&self) -> Mat4 {
        self.view
    }
    pub fn inverse_view(&self) -> Mat4 {
        self.inverse_view
    }
    pub fn position(&self) -> Vec3 {
        self.inverse_view.w_axis.truncate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point(i: usize) -> LightSource {
        LightSource::Point {
            position: Vec3::splat(i as f32),
            color: Vec3::ONE,
            intensity: 0.5,
        }
    }

    #[test]
    fn ubo_layout_matches_std140() {
        assert_eq!(std::mem::size_of::<PointLight>(), 32);
        assert_eq!(std::mem::size_of::<DirectionalLight>(), 32);
        assert_eq!(std::mem::offset_of!(GlobalUbo, ambient_light_color), 192);
        assert_eq!(std::mem::offset_of!(GlobalUbo, point_lights), 208);
        assert_eq!(std::mem::offset_of!(GlobalUbo, directional_lights), 528);
        assert_eq!(std::mem::offset_of!(GlobalUbo, num_point_lights), 848);
        assert_eq!(std::mem::offset_of!(GlobalUbo, num_directional_lights), 852);
        assert_eq!(std::mem::size_of::<GlobalUbo>(), 864);
    }

    #[test]
    fn default_ambient() {
        let ubo = GlobalUbo::default();
        assert_eq!(ubo.ambient_light_color, Vec4::new(0.6, 0.6, 1.0, 0.02));
        assert_eq!(ubo.view, Mat4::IDENTITY);
        assert_eq!(ubo.num_point_lights, 0);
    }

    #[test]
    fn lights_are_packed_by_kind() {
        let mut ubo = GlobalUbo::default();
        let dropped = ubo.set_lights([
            LightSource::Point {
                position: Vec3::new(1.0, 2.0, 3.0),
                color: Vec3::new(1.0, 0.5, 0.25),
                intensity: 4.0,
            },
            LightSource::Directional {
                direction: Vec3::new(0.0, -1.0, 0.0),
                color: Vec3::ONE,
                intensity: 1.5,
            },
        ]);
        assert_eq!(dropped, 0);
        assert_eq!(ubo.num_point_lights, 1);
        assert_eq!(ubo.num_directional_lights, 1);
        assert_eq!(ubo.point_lights[0].position, Vec4::new(1.0, 2.0, 3.0, 1.0));
        assert_eq!(ubo.point_lights[0].color, Vec4::new(1.0, 0.5, 0.25, 4.0));
        assert_eq!(
            ubo.directional_lights[0].direction,
            Vec4::new(0.0, -1.0, 0.0, 0.0)
        );
        assert_eq!(ubo.directional_lights[0].color.w, 1.5);
    }

    #[test]
    fn overflow_keeps_the_first_lights() {
        let mut ubo = GlobalUbo::default();
        let dropped = ubo.set_lights((0..MAX_LIGHTS + 3).map(point));
        assert_eq!(dropped, 3);
        assert_eq!(ubo.num_point_lights, MAX_LIGHTS as i32);
        assert_eq!(ubo.point_lights[MAX_LIGHTS - 1].position.x, (MAX_LIGHTS - 1) as f32);

        // A smaller set clears the stale tail.
        assert_eq!(ubo.set_lights((0..2).map(point)), 0);
        assert_eq!(ubo.num_point_lights, 2);
        assert_eq!(ubo.point_lights[2], PointLight::default());
    }

    #[test]
    fn view_and_inverse_agree() {
        let mut camera = Camera::default();
        camera.set_view_target(Vec3::new(1.0, -2.0, 3.0), Vec3::ZERO, DEFAULT_UP);
        assert!((camera.view() * camera.inverse_view()).abs_diff_eq(Mat4::IDENTITY, 1e-5));
        assert!(camera.position().abs_diff_eq(Vec3::new(1.0, -2.0, 3.0), 1e-6));

        camera.set_view_yxz(Vec3::new(0.0, 1.0, 0.0), Vec3::new(0.3, 1.2, -0.4));
        assert!((camera.view() * camera.inverse_view()).abs_diff_eq(Mat4::IDENTITY, 1e-5));
        let origin_in_view = camera.view().transform_point3(camera.position());
        assert!(origin_in_view.abs_diff_eq(Vec3::ZERO, 1e-5));
    }

    #[test]
    fn perspective_maps_depth_to_unit_range() {
        let mut camera = Camera::default();
        camera.set_perspective_projection(65f32.to_radians(), 16.0 / 9.0, 0.1, 100.0);
        let near = camera.projection().project_point3(Vec3::new(0.0, 0.0, 0.1));
        let far = camera.projection().project_point3(Vec3::new(0.0, 0.0, 100.0));
        assert!((near.z - 0.0).abs() < 1e-5);
        assert!((far.z - 1.0).abs() < 1e-5);
    }

    #[test]
    fn orthographic_maps_box_corners() {
        let mut camera = Camera::default();
        camera.set_orthographic_projection(-2.0, 2.0, -1.0, 1.0, 0.0, 10.0);
        let p = camera.projection().transform_point3(Vec3::new(2.0, 1.0, 10.0));
        assert!(p.abs_diff_eq(Vec3::new(1.0, 1.0, 1.0), 1e-6));
        let q = camera.projection().transform_point3(Vec3::new(-2.0, -1.0, 0.0));
        assert!(q.abs_diff_eq(Vec3::new(-1.0, -1.0, 0.0), 1e-6));
    }

    #[test]
    #[should_panic(expected = "aspect ratio")]
    fn zero_aspect_panics() {
        Camera::default().set_perspective_projection(1.0, 0.0, 0.1, 10.0);
    }
}
