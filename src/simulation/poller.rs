//! Velocity observers sampled during the solve
//!
//! Observers sit at fixed world positions and receive the local fluid velocity
//! every 20th substep. Sampling is a blocking single-texel readback, so it is
//! rate limited and skipped entirely while no observer is attached.

use cgmath::Vector3;

/// Substeps between two velocity samples
pub const POLL_INTERVAL: u64 = 20;

/// Receives the fluid velocity at a fixed point
pub trait VelocityPoller {
    /// World-space sample position
    fn position(&self) -> Vector3<f32>;

    /// Called with the sampled velocity (z is 0 in 2D)
    fn update_velocity(&mut self, velocity: Vector3<f32>);
}

/// Identifies an attached poller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PollerHandle(u64);

/// Attached pollers and the substep counter that gates sampling
#[derive(Default)]
pub struct PollerRegistry {
    pollers: Vec<(PollerHandle, Box<dyn VelocityPoller>)>,
    next_id: u64,
    poll_frame: u64,
}

impl PollerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&mut self, poller: Box<dyn VelocityPoller>) -> PollerHandle {
        let handle = PollerHandle(self.next_id);
        self.next_id += 1;
        self.pollers.push((handle, poller));
        handle
    }

    /// Removes a poller, handing it back to the caller
    pub fn detach(&mut self, handle: PollerHandle) -> Option<Box<dyn VelocityPoller>> {
        let index = self.pollers.iter().position(|(h, _)| *h == handle)?;
        Some(self.pollers.remove(index).1)
    }

    pub fn len(&self) -> usize {
        self.pollers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pollers.is_empty()
    }

    /// Advances the substep counter
    ///
    /// # Returns
    /// `true` when this substep is a sampling substep; the check happens
    /// before the increment, so the first substep always samples
    pub fn tick(&mut self) -> bool {
        let due = self.poll_frame % POLL_INTERVAL == 0;
        self.poll_frame += 1;
        due
    }

    /// Substeps counted since the last reset
    pub fn poll_frame(&self) -> u64 {
        self.poll_frame
    }

    pub fn reset(&mut self) {
        self.poll_frame = 0;
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Box<dyn VelocityPoller>> {
        self.pollers.iter_mut().map(|(_, poller)| poller)
    }
}

impl std::fmt::Debug for PollerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollerRegistry")
            .field("pollers", &self.pollers.len())
            .field("poll_frame", &self.poll_frame)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Probe(Vector3<f32>);

    impl VelocityPoller for Probe {
        fn position(&self) -> Vector3<f32> {
            self.0
        }

        fn update_velocity(&mut self, _velocity: Vector3<f32>) {}
    }

    fn polls_after(substeps: u64) -> u64 {
        let mut registry = PollerRegistry::new();
        (0..substeps).filter(|_| registry.tick()).count() as u64
    }

    #[test]
    fn test_cadence_polls_before_incrementing() {
        assert_eq!(polls_after(1), 1);
        assert_eq!(polls_after(20), 1);
        assert_eq!(polls_after(21), 2);
        assert_eq!(polls_after(40), 2);
        assert_eq!(polls_after(41), 3);
    }

    #[test]
    fn test_attach_and_detach_by_handle() {
        let mut registry = PollerRegistry::new();
        let first = registry.attach(Box::new(Probe(Vector3::new(0.1, 0.2, 0.0))));
        let second = registry.attach(Box::new(Probe(Vector3::new(0.5, 0.5, 0.0))));
        assert_ne!(first, second);
        assert_eq!(registry.len(), 2);

        let detached = registry.detach(first).expect("attached poller");
        assert_eq!(detached.position(), Vector3::new(0.1, 0.2, 0.0));
        assert!(registry.detach(first).is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_reset_restarts_cadence() {
        let mut registry = PollerRegistry::new();
        for _ in 0..7 {
            registry.tick();
        }
        registry.reset();
        assert_eq!(registry.poll_frame(), 0);
        assert!(registry.tick());
    }
}
