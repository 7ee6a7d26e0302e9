//! Substep scheduler for the fluid solver
//!
//! Converts variable frame deltas into fixed solver substeps, carrying the
//! leftover time to the next frame and bounding the work done per frame.

use log::warn;

/// Substeps to run for one frame
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SubstepPlan {
    pub count: u32,
    /// Length of each substep in seconds
    pub step: f32,
}

impl SubstepPlan {
    pub fn none() -> Self {
        Self {
            count: 0,
            step: 0.0,
        }
    }
}

/// Fixed-timestep accumulator
#[derive(Debug, Clone, PartialEq)]
pub struct SubstepScheduler {
    fixed_timestep: f32,
    max_substeps: Option<u32>,
    accumulated_time: f32,
    last_count: u32,
}

impl SubstepScheduler {
    /// Create a new scheduler
    ///
    /// # Arguments
    /// * `fixed_timestep` - Substep length in seconds, 0 for one substep per frame
    /// * `max_substeps` - Per-frame substep cap, or None for no cap
    pub fn new(fixed_timestep: f32, max_substeps: Option<u32>) -> Self {
        Self {
            fixed_timestep,
            max_substeps,
            accumulated_time: 0.0,
            last_count: 0,
        }
    }

    /// Plans the substeps for a frame and advances the accumulator
    ///
    /// # Arguments
    /// * `delta_time` - Time elapsed since last frame in seconds
    ///
    /// # Returns
    /// How many substeps to run and their length
    pub fn plan(&mut self, delta_time: f32) -> SubstepPlan {
        let plan = if self.fixed_timestep <= 0.0 {
            if delta_time > 0.0 {
                SubstepPlan {
                    count: 1,
                    step: delta_time,
                }
            } else {
                SubstepPlan::none()
            }
        } else {
            let fixed_dt = self.fixed_timestep;
            self.accumulated_time += delta_time.max(0.0);

            let mut count = 0;
            while self.accumulated_time > fixed_dt
                && self.max_substeps.map_or(true, |cap| count < cap)
            {
                self.accumulated_time -= fixed_dt;
                count += 1;
            }

            if let Some(cap) = self.max_substeps {
                if count == cap && self.accumulated_time > fixed_dt {
                    warn!(
                        "Substep cap of {} reached, {:.4}s of simulation time deferred",
                        cap, self.accumulated_time
                    );
                }
            }

            SubstepPlan {
                count,
                step: fixed_dt,
            }
        };

        self.last_count = plan.count;
        plan
    }

    /// Unsimulated time carried to the next frame
    pub fn accumulator(&self) -> f32 {
        self.accumulated_time
    }

    /// Substeps planned by the most recent frame
    pub fn last_count(&self) -> u32 {
        self.last_count
    }

    pub fn fixed_timestep(&self) -> f32 {
        self.fixed_timestep
    }

    pub fn max_substeps(&self) -> Option<u32> {
        self.max_substeps
    }

    /// Drops carried time and diagnostics
    pub fn reset(&mut self) {
        self.accumulated_time = 0.0;
        self.last_count = 0;
    }
}

impl Default for SubstepScheduler {
    fn default() -> Self {
        Self::new(0.0, None)
    }
}
