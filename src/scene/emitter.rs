//! Particle emitters and their CPU simulation

use super::random::XorShift32;
use super::Aabb;
use bevy_ecs::prelude::*;
use glam::{Quat, Vec3, Vec4};

/// Hard cap on live particles per emitter
pub const MAX_PARTICLES_PER_EMITTER: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EmitterType {
    /// Particles leave in every direction
    #[default]
    Omni,
    /// Particles leave inside a cone around local -Z
    Spot,
}

/// Particle emitter component
#[derive(Component, Debug, Clone, PartialEq)]
pub struct ParticleEmitter {
    pub emitter_type: EmitterType,
    pub position: Vec3,
    pub orientation: Quat,
    pub particles_per_second: f32,
    /// Seconds a particle lives
    pub life_span: f32,
    pub start_size: f32,
    pub end_size: f32,
    pub speed: f32,
    /// Cone angle in degrees for spot emitters
    pub spread: f32,
    pub gravity: Vec3,
    pub start_color: Vec4,
    pub end_color: Vec4,
}

impl Default for ParticleEmitter {
    fn default() -> Self {
        Self {
            emitter_type: EmitterType::Omni,
            position: Vec3::ZERO,
            orientation: Quat::IDENTITY,
            particles_per_second: 10.0,
            life_span: 5.0,
            start_size: 0.1,
            end_size: 1.0,
            speed: 1.0,
            spread: 30.0,
            gravity: Vec3::ZERO,
            start_color: Vec4::ONE,
            end_color: Vec4::new(1.0, 1.0, 1.0, 0.0),
        }
    }
}

impl ParticleEmitter {
    pub fn new(position: Vec3) -> Self {
        Self {
            position,
            ..Default::default()
        }
    }

    /// Box containing every position a particle can reach during its life
    pub fn bounding_box(&self) -> Aabb {
        let t = self.life_span.max(0.0);
        let reach = self.speed.abs() * t
            + 0.5 * self.gravity.length() * t * t
            + self.start_size.max(self.end_size);
        Aabb::from_center(self.position, Vec3::splat(reach))
    }

    fn spawn_direction(&self, rng: &mut XorShift32) -> Vec3 {
        match self.emitter_type {
            EmitterType::Omni => loop {
                let v = Vec3::new(rng.next_signed(), rng.next_signed(), rng.next_signed());
                let len = v.length_squared();
                if len > 1e-4 && len <= 1.0 {
                    break v / len.sqrt();
                }
            },
            EmitterType::Spot => {
                let half_angle = (self.spread * 0.5).clamp(0.0, 180.0).to_radians();
                let cos_min = half_angle.cos();
                let z = cos_min + (1.0 - cos_min) * rng.next_f32();
                let phi = rng.next_f32() * std::f32::consts::TAU;
                let r = (1.0 - z * z).max(0.0).sqrt();
                self.orientation * Vec3::new(r * phi.cos(), r * phi.sin(), -z)
            }
        }
    }
}

/// One simulated particle
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Particle {
    pub position: Vec3,
    pub velocity: Vec3,
    /// Normalized age, 0 at birth and 1 at death
    pub life: f32,
    pub start_size: f32,
    pub end_size: f32,
}

impl Particle {
    pub fn size(&self) -> f32 {
        self.start_size + (self.end_size - self.start_size) * self.life
    }
}

/// Live particles of one emitter
///
/// Emitters stay simulated while they are visible or still have particles in
/// flight. An emitter that left the view stops spawning and is dropped once
/// its last particle dies.
#[derive(Debug, Clone)]
pub struct EmitterSimulation {
    particles: Vec<Particle>,
    spawn_accumulator: f32,
    rng: XorShift32,
    pub(crate) visible: bool,
}

impl EmitterSimulation {
    pub fn new(seed: u32) -> Self {
        Self {
            particles: Vec::new(),
            spawn_accumulator: 0.0,
            rng: XorShift32::new(seed),
            visible: false,
        }
    }

    pub fn particles(&self) -> &[Particle] {
        &self.particles
    }

    pub fn is_visible(&self) -> bool {
        self.visible
    }

    /// Advance by `elapsed` seconds; returns whether the emitter is still active
    pub fn update(&mut self, emitter: &ParticleEmitter, elapsed: f32) -> bool {
        let elapsed = elapsed.max(0.0);
        let life_step = elapsed / emitter.life_span.max(1e-3);

        self.particles.retain_mut(|particle| {
            particle.life += life_step;
            if particle.life >= 1.0 {
                return false;
            }
            particle.velocity += emitter.gravity * elapsed;
            particle.position += particle.velocity * elapsed;
            true
        });

        if self.visible {
            self.spawn_accumulator += emitter.particles_per_second.max(0.0) * elapsed;
            let count = self.spawn_accumulator.floor();
            self.spawn_accumulator -= count;
            let room = MAX_PARTICLES_PER_EMITTER.saturating_sub(self.particles.len());
            for _ in 0..(count as usize).min(room) {
                let velocity = emitter.spawn_direction(&mut self.rng) * emitter.speed;
                self.particles.push(Particle {
                    position: emitter.position,
                    velocity,
                    life: 0.0,
                    start_size: emitter.start_size,
                    end_size: emitter.end_size,
                });
            }
        } else {
            self.spawn_accumulator = 0.0;
        }

        self.visible || !self.particles.is_empty()
    }

    /// Instance vectors sorted back to front from `eye`
    ///
    /// Two vectors per particle: (position, size) and (life, 0, 0, 0).
    pub fn instance_vectors(&self, eye: Vec3) -> Vec<[f32; 8]> {
        let mut order: Vec<(f32, usize)> = self
            .particles
            .iter()
            .enumerate()
            .map(|(i, p)| ((p.position - eye).length_squared(), i))
            .collect();
        order.sort_by(|a, b| b.0.total_cmp(&a.0));

        order
            .into_iter()
            .map(|(_, i)| {
                let p = &self.particles[i];
                [
                    p.position.x,
                    p.position.y,
                    p.position.z,
                    p.size(),
                    p.life,
                    0.0,
                    0.0,
                    0.0,
                ]
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fountain() -> ParticleEmitter {
        ParticleEmitter {
            particles_per_second: 10.0,
            life_span: 1.0,
            speed: 2.0,
            gravity: Vec3::new(0.0, -9.8, 0.0),
            ..Default::default()
        }
    }

    #[test]
    fn test_visible_emitter_spawns_at_rate() {
        let emitter = fountain();
        let mut sim = EmitterSimulation::new(1);
        sim.visible = true;
        assert!(sim.update(&emitter, 0.5));
        assert_eq!(sim.particles().len(), 5);
    }

    #[test]
    fn test_hidden_emitter_drains_then_goes_inactive() {
        let emitter = fountain();
        let mut sim = EmitterSimulation::new(1);
        sim.visible = true;
        sim.update(&emitter, 0.5);
        sim.visible = false;
        assert!(sim.update(&emitter, 0.25));
        assert_eq!(sim.particles().len(), 5);
        assert!(!sim.update(&emitter, 1.0));
        assert!(sim.particles().is_empty());
    }

    #[test]
    fn test_size_interpolates_over_life() {
        let p = Particle {
            position: Vec3::ZERO,
            velocity: Vec3::ZERO,
            life: 0.25,
            start_size: 1.0,
            end_size: 3.0,
        };
        assert!((p.size() - 1.5).abs() < 1e-6);
    }

    #[test]
    fn test_instances_sorted_back_to_front() {
        let emitter = ParticleEmitter {
            particles_per_second: 100.0,
            life_span: 10.0,
            speed: 3.0,
            ..Default::default()
        };
        let mut sim = EmitterSimulation::new(42);
        sim.visible = true;
        sim.update(&emitter, 0.1);
        sim.update(&emitter, 0.5);

        let eye = Vec3::new(0.0, 0.0, 20.0);
        let vectors = sim.instance_vectors(eye);
        assert_eq!(vectors.len(), sim.particles().len());
        let distances: Vec<f32> = vectors
            .iter()
            .map(|v| (Vec3::new(v[0], v[1], v[2]) - eye).length_squared())
            .collect();
        assert!(distances.windows(2).all(|w| w[0] >= w[1]));
    }

    #[test]
    fn test_spot_particles_stay_in_cone() {
        let emitter = ParticleEmitter {
            emitter_type: EmitterType::Spot,
            spread: 20.0,
            ..Default::default()
        };
        let mut rng = XorShift32::new(3);
        for _ in 0..200 {
            let dir = emitter.spawn_direction(&mut rng);
            let angle = dir.angle_between(-Vec3::Z).to_degrees();
            assert!(angle <= 10.01, "angle {angle}");
        }
    }
}
