//! Viewer description and visibility-driven pausing

use glam::{Mat4, Vec3, Vec4};

/// Where the reconstruction is being looked at from
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewpoint {
    pub position: Vec3,
    /// Unit viewing direction
    pub forward: Vec3,
    pub view_projection: Mat4,
    pub far_clip: f32,
}

impl Default for Viewpoint {
    fn default() -> Self {
        Self::look_at(Vec3::new(0.0, 0.0, -2.0), Vec3::ZERO, 60.0, 0.1, 100.0)
    }
}

impl Viewpoint {
    /// Right-handed perspective viewer with wgpu's 0..1 depth range
    pub fn look_at(position: Vec3, target: Vec3, fov_y_deg: f32, near: f32, far: f32) -> Self {
        let forward = (target - position).normalize_or_zero();
        let up = if forward.cross(Vec3::Y).length_squared() < 1.0e-6 {
            Vec3::Z
        } else {
            Vec3::Y
        };
        let view = Mat4::look_at_rh(position, target, up);
        let projection = Mat4::perspective_rh(fov_y_deg.to_radians(), 1.0, near, far);
        Self {
            position,
            forward,
            view_projection: projection * view,
            far_clip: far,
        }
    }
}

/// Six inward-facing planes `(n, d)` with `n·p + d >= 0` inside
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Frustum {
    pub planes: [Vec4; 6],
}

impl Frustum {
    pub fn from_view_projection(view_projection: &Mat4) -> Self {
        let r0 = view_projection.row(0);
        let r1 = view_projection.row(1);
        let r2 = view_projection.row(2);
        let r3 = view_projection.row(3);
        let planes = [r3 + r0, r3 - r0, r3 + r1, r3 - r1, r2, r3 - r2].map(|plane| {
            let length = plane.truncate().length();
            if length > 0.0 {
                plane / length
            } else {
                plane
            }
        });
        Self { planes }
    }

    /// False only when the box lies fully outside one plane
    pub fn intersects_aabb(&self, min: Vec3, max: Vec3) -> bool {
        self.planes.iter().all(|plane| {
            let normal = plane.truncate();
            let positive = Vec3::select(normal.cmpge(Vec3::ZERO), max, min);
            normal.dot(positive) + plane.w >= 0.0
        })
    }
}

/// Player that can be paused while its output is off screen
pub trait PlaybackControl: Send {
    fn is_playing(&self) -> bool;
    fn pause(&mut self);
    fn play(&mut self);
}

/// What a visibility change asks the caller to do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VisibilityChange {
    Unchanged,
    BecameVisible,
    BecameInvisible,
}

/// Pauses generation (and optionally playback) while bounds are off screen
#[derive(Default)]
pub struct VisibilityGate {
    pub pause_generation_when_invisible: bool,
    pub pause_player_when_invisible: bool,
    visible: Option<bool>,
    paused_player: bool,
    player: Option<Box<dyn PlaybackControl>>,
}

impl std::fmt::Debug for VisibilityGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VisibilityGate")
            .field("pause_generation_when_invisible", &self.pause_generation_when_invisible)
            .field("pause_player_when_invisible", &self.pause_player_when_invisible)
            .field("visible", &self.visible)
            .field("has_player", &self.player.is_some())
            .finish()
    }
}

impl VisibilityGate {
    pub fn new(pause_generation: bool, pause_player: bool) -> Self {
        Self {
            pause_generation_when_invisible: pause_generation,
            pause_player_when_invisible: pause_player,
            ..Default::default()
        }
    }

    pub fn attach_player(&mut self, player: Box<dyn PlaybackControl>) {
        self.player = Some(player);
    }

    pub fn detach_player(&mut self) -> Option<Box<dyn PlaybackControl>> {
        self.paused_player = false;
        self.player.take()
    }

    /// Last observed visibility; unknown counts as visible
    pub fn is_visible(&self) -> bool {
        self.visible.unwrap_or(true)
    }

    /// Whether generation may run this tick
    pub fn allows_generation(&self) -> bool {
        !self.pause_generation_when_invisible || self.is_visible()
    }

    /// Feed this tick's world bounds and viewer
    pub fn update(&mut self, world_min: Vec3, world_max: Vec3, viewpoint: &Viewpoint) -> VisibilityChange {
        let frustum = Frustum::from_view_projection(&viewpoint.view_projection);
        self.set_visible(frustum.intersects_aabb(world_min, world_max))
    }

    pub fn set_visible(&mut self, visible: bool) -> VisibilityChange {
        if self.visible == Some(visible) {
            return VisibilityChange::Unchanged;
        }
        let first = self.visible.is_none();
        self.visible = Some(visible);
        if visible {
            if self.paused_player {
                if let Some(player) = self.player.as_mut() {
                    player.play();
                }
                self.paused_player = false;
            }
            if first {
                VisibilityChange::Unchanged
            } else {
                VisibilityChange::BecameVisible
            }
        } else {
            if self.pause_player_when_invisible {
                if let Some(player) = self.player.as_mut() {
                    if player.is_playing() {
                        player.pause();
                        self.paused_player = true;
                    }
                }
            }
            VisibilityChange::BecameInvisible
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    struct FakePlayer(Arc<AtomicBool>);

    impl PlaybackControl for FakePlayer {
        fn is_playing(&self) -> bool {
            self.0.load(Ordering::SeqCst)
        }
        fn pause(&mut self) {
            self.0.store(false, Ordering::SeqCst);
        }
        fn play(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_frustum_contains_target() {
        let viewer = Viewpoint::look_at(Vec3::new(0.0, 0.0, -3.0), Vec3::ZERO, 60.0, 0.1, 50.0);
        let frustum = Frustum::from_view_projection(&viewer.view_projection);
        assert!(frustum.intersects_aabb(Vec3::splat(-0.5), Vec3::splat(0.5)));
        assert!(!frustum.intersects_aabb(Vec3::new(-0.5, -0.5, -10.0), Vec3::new(0.5, 0.5, -9.0)));
        assert!(!frustum.intersects_aabb(Vec3::new(40.0, -0.5, -0.5), Vec3::new(41.0, 0.5, 0.5)));
    }

    #[test]
    fn test_gate_pauses_and_resumes_player() {
        let playing = Arc::new(AtomicBool::new(true));
        let mut gate = VisibilityGate::new(true, true);
        gate.attach_player(Box::new(FakePlayer(playing.clone())));

        assert_eq!(gate.set_visible(true), VisibilityChange::Unchanged);
        assert_eq!(gate.set_visible(false), VisibilityChange::BecameInvisible);
        assert!(!gate.allows_generation());
        assert!(!playing.load(Ordering::SeqCst));

        assert_eq!(gate.set_visible(true), VisibilityChange::BecameVisible);
        assert!(gate.allows_generation());
        assert!(playing.load(Ordering::SeqCst));
    }

    #[test]
    fn test_gate_without_pause_flags_always_generates() {
        let mut gate = VisibilityGate::default();
        gate.set_visible(false);
        assert!(gate.allows_generation());
    }
}
