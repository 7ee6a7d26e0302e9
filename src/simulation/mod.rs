//! Fluid simulation
//!
//! The solver itself lives in [`fluid`] (state and public API) and
//! [`pipeline`] (the per-frame kernel sequence). The remaining modules hold
//! the host-side bookkeeping it drives: substep scheduling, queued user
//! interactions and velocity observers.

pub mod fluid;
pub mod interaction;
pub mod pipeline;
pub mod poller;
pub mod scheduler;

pub use fluid::{Fluid, FrameStats};
pub use interaction::{Boundary, Injector, InteractionQueue, Perturber};
pub use pipeline::VORTICITY_EPSILON;
pub use poller::{PollerHandle, VelocityPoller, POLL_INTERVAL};
pub use scheduler::{SubstepPlan, SubstepScheduler};
