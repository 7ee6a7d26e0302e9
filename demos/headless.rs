//! # Headless Smoke Plume
//!
//! Runs the 2D solver on the GPU without a window: a source of warm ink at
//! the bottom of the box, a solid block in its path and an observer above
//! it. Frame statistics are logged once per simulated second.
//!
//! ## Usage
//!
//! Run with: `RUST_LOG=info cargo run --example headless`

use std::sync::{Arc, Mutex};

use anyhow::Context;
use log::info;
use stokes::prelude::*;

const FRAMES: u32 = 300;
const FRAME_DT: f32 = 1.0 / 60.0;

/// Records the last velocity seen at a point
struct Probe {
    position: Vector3<f32>,
    last: Arc<Mutex<Vector3<f32>>>,
}

impl VelocityPoller for Probe {
    fn position(&self) -> Vector3<f32> {
        self.position
    }

    fn update_velocity(&mut self, velocity: Vector3<f32>) {
        if let Ok(mut last) = self.last.lock() {
            *last = velocity;
        }
    }
}

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let mut fluid = stokes::headless().context("no GPU available for the solver")?;
    fluid
        .init(
            FluidOptions::default_2d()
                .with_solver_resolution(Vector3::new(128, 128, 1))
                .with_render_resolution(Vector2::new(256, 256))
                .with_viscosity(VISCOSITY_AIR)
                .with_flags(SolverFlags::NICE | SolverFlags::DOUBLE_PRECISION)
                .with_fixed_time_interval(1.0 / 120.0),
        )
        .context("solver initialization failed")?;

    // Negative densities make the ink rise
    fluid.set_color_densities(-2.0, -1.0, -0.5);
    fluid.add_arbitrary_boundary(Vector3::new(0.5, 0.6, 0.0), 0.1);

    let sampled = Arc::new(Mutex::new(Vector3::new(0.0, 0.0, 0.0)));
    fluid.attach_poller(Box::new(Probe {
        position: Vector3::new(0.5, 0.8, 0.0),
        last: sampled.clone(),
    }));

    for frame in 0..FRAMES {
        fluid.inject(Vector3::new(0.5, 0.1, 0.0), 0.8, 0.3, 0.1, 0.08, false);
        fluid.perturb(Vector3::new(0.5, 0.1, 0.0), Vector3::new(0.0, 0.5, 0.0), 0.05);
        fluid.update(FRAME_DT)?;
        fluid.render()?;

        if frame % 60 == 59 {
            let stats = fluid.frame_stats();
            let velocity = sampled.lock().map(|v| *v).unwrap_or(Vector3::new(0.0, 0.0, 0.0));
            info!(
                "frame {}: {} substeps, {} dispatches, {} polls, probe velocity ({:.3}, {:.3})",
                frame + 1,
                stats.substeps,
                stats.dispatches,
                stats.polls,
                velocity.x,
                velocity.y
            );
        }
    }

    let ink = fluid.read_field(FieldId::Data)?;
    let total: f32 = ink.iter().map(|texel| texel[0] + texel[1] + texel[2]).sum();
    info!("Total ink after {} frames: {:.2}", FRAMES, total);

    if let Some(texture) = fluid.display_texture() {
        let size = texture.size();
        info!("Display texture ready at {}x{}", size.width, size.height);
    }
    Ok(())
}
