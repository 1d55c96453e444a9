//! Pointer trajectories for slider drags.
//!
//! Pure functions only: the same seed always yields the same path, so the
//! drag and its correction loop can be tested without a browser.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// Tuning for the closed-loop correction phase.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Correction {
    /// Stop once the remaining distance is at most this (px).
    pub tolerance: f64,
    /// Largest single corrective move (px).
    pub max_step: f64,
    /// Smallest corrective move (px).
    pub min_step: f64,
}

impl Default for Correction {
    fn default() -> Self {
        Self {
            tolerance: 2.0,
            max_step: 40.0,
            min_step: 1.0,
        }
    }
}

fn cubic(p0: f64, p1: f64, p2: f64, p3: f64, t: f64) -> f64 {
    let u = 1.0 - t;
    u * u * u * p0 + 3.0 * u * u * t * p1 + 3.0 * u * t * t * p2 + t * t * t * p3
}

/// Randomized cubic-Bezier path from `from` to `to`, eased so the pointer
/// slows down near the end. The last point is exactly `to`.
pub fn bezier_path(from: Point, to: Point, seed: u64, steps: usize) -> Vec<Point> {
    let steps = steps.max(2);
    let mut rng = StdRng::seed_from_u64(seed);
    let dx = to.x - from.x;
    let dy = to.y - from.y;

    let c1 = Point::new(
        from.x + dx * rng.gen_range(0.15..0.40),
        from.y + dy * 0.3 + rng.gen_range(-4.0..4.0),
    );
    let c2 = Point::new(
        from.x + dx * rng.gen_range(0.60..0.90),
        from.y + dy * 0.7 + rng.gen_range(-4.0..4.0),
    );

    let mut path = Vec::with_capacity(steps);
    for i in 1..=steps {
        let linear = i as f64 / steps as f64;
        let t = 1.0 - (1.0 - linear).powi(3);
        let jitter = if i == steps { 0.0 } else { rng.gen_range(-0.6..0.6) };
        path.push(Point::new(
            cubic(from.x, c1.x, c2.x, to.x, t),
            cubic(from.y, c1.y, c2.y, to.y, t) + jitter,
        ));
    }
    if let Some(last) = path.last_mut() {
        *last = to;
    }
    path
}

/// How far past the target the initial drag goes before correcting back.
pub fn overshoot(distance: f64, seed: u64) -> f64 {
    let mut rng = StdRng::seed_from_u64(seed.rotate_left(17));
    let extra = distance.abs().min(200.0) * rng.gen_range(0.02..0.06) + rng.gen_range(2.0..5.0);
    extra.copysign(if distance == 0.0 { 1.0 } else { distance })
}

/// Number of path points for a drag of `distance` pixels.
pub fn path_steps(distance: f64) -> usize {
    (distance.abs() / 6.0).clamp(12.0, 60.0) as usize
}

/// One corrective move toward the target. Damping grows as the remaining
/// distance shrinks; the move is clamped to `[min_step, max_step]`.
pub fn correction_step(delta: f64, cfg: &Correction) -> f64 {
    let magnitude = delta.abs();
    if magnitude <= cfg.tolerance {
        return 0.0;
    }
    let gain = if magnitude > 30.0 {
        0.85
    } else if magnitude > 12.0 {
        0.7
    } else if magnitude > 5.0 {
        0.5
    } else {
        0.35
    };
    let step = (magnitude * gain).clamp(cfg.min_step.min(magnitude), cfg.max_step);
    step.copysign(delta)
}

/// Outcome of a simulated correction run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Simulation {
    pub position: f64,
    pub iterations: u32,
    pub converged: bool,
}

/// Run the correction loop against a plant whose response to each move is
/// off by up to ±15%.
pub fn simulate_correction(
    start: f64,
    target: f64,
    seed: u64,
    cfg: &Correction,
    max_iterations: u32,
) -> Simulation {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut position = start;
    for iteration in 0..max_iterations {
        let delta = target - position;
        if delta.abs() <= cfg.tolerance {
            return Simulation {
                position,
                iterations: iteration,
                converged: true,
            };
        }
        position += correction_step(delta, cfg) * rng.gen_range(0.85..1.15);
    }
    Simulation {
        position,
        iterations: max_iterations,
        converged: (target - position).abs() <= cfg.tolerance,
    }
}
