//! Humanlike pointer motion.
//!
//! Paths follow a cubic Bezier curve with jittered control points, sometimes
//! overshoot the target and correct back, and are replayed with small random
//! pauses between steps. Whatever happens on the way, the last emitted point
//! is exactly the requested target.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Result;
use crate::page::PageHandle;

const MIN_STEPS: usize = 15;
const MAX_STEPS: usize = 50;
/// One step per this many pixels of straight-line distance.
const PIXELS_PER_STEP: f64 = 10.0;

const OVERSHOOT_PROBABILITY: f64 = 0.3;
const OVERSHOOT_MIN_PX: f64 = 2.0;
const OVERSHOOT_MAX_PX: f64 = 10.0;
const CORRECTION_STEPS: usize = 5;

const CONTROL_JITTER_PX: f64 = 50.0;

const STEP_DELAY_MIN_MS: f64 = 5.0;
const STEP_DELAY_MAX_MS: f64 = 15.0;
const HESITATION_PROBABILITY: f64 = 0.05;
const HESITATION_MIN_MS: f64 = 10.0;
const HESITATION_MAX_MS: f64 = 30.0;

/// A viewport coordinate in CSS pixels.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn distance(&self, other: Point) -> f64 {
        (other.x - self.x).hypot(other.y - self.y)
    }
}

fn uniform(lo: f64, hi: f64) -> f64 {
    lo + rand::random::<f64>() * (hi - lo)
}

/// A fully planned pointer trajectory.
#[derive(Debug, Clone)]
pub struct MotionPlan {
    pub points: Vec<Point>,
    pub overshoot: Option<Point>,
}

impl MotionPlan {
    /// Plan a path from `start` to `target`, rolling the overshoot dice.
    pub fn new(start: Point, target: Point) -> Self {
        let overshoot = rand::random::<f64>() < OVERSHOOT_PROBABILITY;
        Self::with_overshoot(start, target, overshoot)
    }

    pub fn with_overshoot(start: Point, target: Point, overshoot: bool) -> Self {
        let steps = step_count(start.distance(target));

        let end = if overshoot {
            let amount = uniform(OVERSHOOT_MIN_PX, OVERSHOOT_MAX_PX);
            let angle = (target.y - start.y).atan2(target.x - start.x);
            Point::new(
                target.x + angle.cos() * amount,
                target.y + angle.sin() * amount,
            )
        } else {
            target
        };

        let c1 = control_point(start, end, 0.2, 0.5);
        let c2 = control_point(start, end, 0.5, 0.8);

        let mut points: Vec<Point> = (0..=steps)
            .map(|i| cubic_bezier(start, c1, c2, end, i as f64 / steps as f64))
            .collect();

        if end != target {
            for i in 1..CORRECTION_STEPS {
                let t = i as f64 / CORRECTION_STEPS as f64;
                points.push(Point::new(
                    end.x + (target.x - end.x) * t,
                    end.y + (target.y - end.y) * t,
                ));
            }
        }

        if points.last() != Some(&target) {
            points.push(target);
        }

        Self {
            points,
            overshoot: (end != target).then_some(end),
        }
    }

    pub fn last(&self) -> Point {
        self.points.last().copied().unwrap_or_default()
    }
}

fn step_count(distance: f64) -> usize {
    ((distance / PIXELS_PER_STEP) as usize).clamp(MIN_STEPS, MAX_STEPS)
}

fn control_point(start: Point, end: Point, lo: f64, hi: f64) -> Point {
    Point::new(
        start.x + (end.x - start.x) * uniform(lo, hi) + uniform(-CONTROL_JITTER_PX, CONTROL_JITTER_PX),
        start.y + (end.y - start.y) * uniform(lo, hi) + uniform(-CONTROL_JITTER_PX, CONTROL_JITTER_PX),
    )
}

fn cubic_bezier(p0: Point, p1: Point, p2: Point, p3: Point, t: f64) -> Point {
    let u = 1.0 - t;
    let (a, b, c, d) = (u * u * u, 3.0 * u * u * t, 3.0 * u * t * t, t * t * t);
    Point::new(
        a * p0.x + b * p1.x + c * p2.x + d * p3.x,
        a * p0.y + b * p1.y + c * p2.y + d * p3.y,
    )
}

fn step_delay() -> Duration {
    let mut ms = uniform(STEP_DELAY_MIN_MS, STEP_DELAY_MAX_MS);
    if rand::random::<f64>() < HESITATION_PROBABILITY {
        ms += uniform(HESITATION_MIN_MS, HESITATION_MAX_MS);
    }
    Duration::from_micros((ms * 1000.0) as u64)
}

/// Virtual pointer that remembers where it last stopped.
#[derive(Debug, Default)]
pub struct HumanMouse {
    position: parking_lot::Mutex<Point>,
}

impl HumanMouse {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn position(&self) -> Point {
        *self.position.lock()
    }

    /// Move from `start` to `target` along a planned path, pausing between
    /// steps. Pointer failures propagate unchanged.
    pub async fn move_between(
        &self,
        page: &dyn PageHandle,
        start: Point,
        target: Point,
    ) -> Result<()> {
        let plan = MotionPlan::new(start, target);
        debug!(
            steps = plan.points.len(),
            overshoot = plan.overshoot.is_some(),
            "Moving pointer to ({:.0}, {:.0})",
            target.x,
            target.y
        );

        for point in &plan.points {
            page.mouse_move(*point).await?;
            tokio::time::sleep(step_delay()).await;
        }

        *self.position.lock() = target;
        Ok(())
    }

    /// Move from the remembered position to `target`.
    pub async fn move_to(&self, page: &dyn PageHandle, target: Point) -> Result<()> {
        let start = self.position();
        self.move_between(page, start, target).await
    }

    /// Move to `target` and click there.
    pub async fn click_at(&self, page: &dyn PageHandle, target: Point) -> Result<()> {
        self.move_to(page, target).await?;
        page.mouse_click(target).await
    }
}
