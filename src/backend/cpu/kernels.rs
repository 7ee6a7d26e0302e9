//! Host implementations of the solver kernels
//!
//! Each arm of [`Evaluation::evaluate`] computes one output cell the way the
//! matching entry point in `fluid.wgsl` does. Neighbour reads clamp to the
//! input's grid, so cells on the domain edge see themselves past the edge.

use cgmath::{InnerSpace, Vector3, Vector4};

use super::CpuTexture;
use crate::backend::Dispatch;
use crate::grid::GridLayout;
use crate::kernels::{KernelKind, MAX_TEXTURE_INPUTS, MAX_VECTOR_PARAMS};

fn zero() -> Vector4<f32> {
    Vector4::new(0.0, 0.0, 0.0, 0.0)
}

fn lerp(a: Vector4<f32>, b: Vector4<f32>, t: f32) -> Vector4<f32> {
    a * (1.0 - t) + b * t
}

fn step(cell: [i32; 3], axis: usize, by: i32) -> [i32; 3] {
    let mut out = cell;
    out[axis] += by;
    out
}

fn non_zero(v: Vector4<f32>) -> bool {
    v.x != 0.0 || v.y != 0.0 || v.z != 0.0 || v.w != 0.0
}

/// Bound state of one dispatch
pub(super) struct Evaluation<'a> {
    kernel: KernelKind,
    params: &'a [[f32; 4]; MAX_VECTOR_PARAMS],
    inputs: [Option<&'a CpuTexture>; MAX_TEXTURE_INPUTS],
    target: GridLayout,
    source: GridLayout,
    axes: usize,
}

impl<'a> Evaluation<'a> {
    pub(super) fn new(
        dispatch: &Dispatch<'a>,
        inputs: [Option<&'a CpuTexture>; MAX_TEXTURE_INPUTS],
    ) -> Self {
        Self {
            kernel: dispatch.kernel,
            params: dispatch.params,
            inputs,
            target: dispatch.target_layout,
            source: dispatch.source_layout,
            axes: dispatch.source_layout.dimensionality().axis_count(),
        }
    }

    fn param(&self, slot: usize) -> Vector4<f32> {
        Vector4::from(self.params[slot])
    }

    fn fetch(&self, slot: usize, cell: [i32; 3]) -> Vector4<f32> {
        match self.inputs[slot] {
            Some(texture) => texture.fetch(cell),
            None => zero(),
        }
    }

    /// Bilinear sample (trilinear for volumes) at a position in cell units
    fn sample(&self, slot: usize, pos: [f32; 3]) -> Vector4<f32> {
        let base = [pos[0].floor(), pos[1].floor(), pos[2].floor()];
        let f = [pos[0] - base[0], pos[1] - base[1], pos[2] - base[2]];
        let i = [base[0] as i32, base[1] as i32, base[2] as i32];
        let corner = |dx: i32, dy: i32, dz: i32| self.fetch(slot, [i[0] + dx, i[1] + dy, i[2] + dz]);

        let plane = |dz: i32| {
            lerp(
                lerp(corner(0, 0, dz), corner(1, 0, dz), f[0]),
                lerp(corner(0, 1, dz), corner(1, 1, dz), f[0]),
                f[1],
            )
        };

        let lower = plane(0);
        if self.axes < 3 {
            return lower;
        }
        lerp(lower, plane(1), f[2])
    }

    /// Maps cell centres through a per-axis scale on the active axes
    fn rescale(&self, cell: [i32; 3], scale: Vector4<f32>) -> [f32; 3] {
        let mut pos = [cell[0] as f32, cell[1] as f32, cell[2] as f32];
        for axis in 0..self.axes {
            pos[axis] = (pos[axis] + 0.5) * scale[axis] - 0.5;
        }
        pos
    }

    pub(super) fn evaluate(&self, cell: [i32; 3]) -> Vector4<f32> {
        match self.kernel {
            KernelKind::Copy => self.fetch(0, cell),
            KernelKind::Advect => self.advect(cell),
            KernelKind::Vorticity => self.vorticity(cell),
            KernelKind::SplatVelocity => self.splat_velocity(cell),
            KernelKind::Buoyancy => self.buoyancy(cell),
            KernelKind::BoundaryScalar | KernelKind::BoundaryVector => self.boundary(cell),
            KernelKind::Offsets => self.offsets(cell),
            KernelKind::JacobiScalar | KernelKind::JacobiVector => self.jacobi(cell),
            KernelKind::ZCull => self.zcull(cell),
            KernelKind::Divergence => self.divergence(cell),
            KernelKind::SubtractGradient => self.subtract_gradient(cell),
            KernelKind::SplatInk => self.splat_ink(cell),
            KernelKind::SplatBoundary => self.splat_boundary(cell),
            KernelKind::Render => self.render(cell),
        }
    }

    // inputs: velocity, data, boundaries
    fn advect(&self, cell: [i32; 3]) -> Vector4<f32> {
        let delta = self.param(0);
        let scale = self.param(1);
        let dt = self.param(2).x;

        let here = self.rescale(cell, scale);
        let velocity = self.sample(0, here);

        let mut back = here;
        let mut nearest = cell;
        for axis in 0..self.axes {
            back[axis] = here[axis] - dt * velocity[axis] / delta[axis];
            nearest[axis] = (back[axis] + 0.5).floor() as i32;
        }

        let res = self.source.resolution();
        let in_wall = (0..self.axes)
            .any(|axis| nearest[axis] <= 0 || nearest[axis] >= res[axis] as i32 - 1);
        if in_wall || self.fetch(2, nearest).x > 0.0 {
            return self.fetch(1, cell);
        }

        let mut source = back;
        for axis in 0..self.axes {
            source[axis] = (back[axis] + 0.5) / scale[axis] - 0.5;
        }
        self.sample(1, source)
    }

    fn curl(&self, cell: [i32; 3], delta: Vector4<f32>) -> Vector3<f32> {
        let d = |axis: usize, component: usize| {
            (self.fetch(0, step(cell, axis, 1))[component]
                - self.fetch(0, step(cell, axis, -1))[component])
                / (2.0 * delta[axis])
        };
        if self.axes < 3 {
            Vector3::new(0.0, 0.0, d(0, 1) - d(1, 0))
        } else {
            Vector3::new(d(1, 2) - d(2, 1), d(2, 0) - d(0, 2), d(0, 1) - d(1, 0))
        }
    }

    // inputs: velocity
    fn vorticity(&self, cell: [i32; 3]) -> Vector4<f32> {
        let delta = self.param(0);
        let epsilon = self.param(1).x;
        let dt = self.param(2).x;

        let omega = self.curl(cell, delta);
        let mut gradient = Vector3::new(0.0, 0.0, 0.0);
        for axis in 0..self.axes {
            let ahead = self.curl(step(cell, axis, 1), delta).magnitude();
            let behind = self.curl(step(cell, axis, -1), delta).magnitude();
            gradient[axis] = (ahead - behind) / (2.0 * delta[axis]);
        }

        let normal = gradient / (gradient.magnitude() + 1e-5);
        let force = normal.cross(omega) * (epsilon * delta.x);
        self.fetch(0, cell) + force.extend(0.0) * dt
    }

    // inputs: field
    fn splat_velocity(&self, cell: [i32; 3]) -> Vector4<f32> {
        let center = self.param(0);
        let velocity = self.param(1);
        let radius = self.param(2).x.max(1e-3);

        let mut distance2 = 0.0;
        for axis in 0..self.axes {
            let d = cell[axis] as f32 - center[axis];
            distance2 += d * d;
        }
        let weight = (-distance2 / (radius * radius)).exp();
        self.fetch(0, cell) + velocity.truncate().extend(0.0) * weight
    }

    // inputs: velocity, data
    fn buoyancy(&self, cell: [i32; 3]) -> Vector4<f32> {
        let scale = self.param(0);
        let densities = self.param(1);
        let dt = self.param(2).x;

        let ink = self.sample(1, self.rescale(cell, scale));
        let weight = ink.x * densities.x + ink.y * densities.y + ink.z * densities.z;
        let mut velocity = self.fetch(0, cell);
        velocity.y -= dt * weight;
        velocity
    }

    // inputs: field, offsets
    fn boundary(&self, cell: [i32; 3]) -> Vector4<f32> {
        let scale = self.param(0).x;
        let offset = self.fetch(1, cell);
        if offset.w < 0.5 {
            return self.fetch(0, cell);
        }

        let shift = [
            offset.x.round() as i32,
            offset.y.round() as i32,
            offset.z.round() as i32,
        ];
        if shift == [0, 0, 0] {
            return zero();
        }
        let mirror = [cell[0] + shift[0], cell[1] + shift[1], cell[2] + shift[2]];
        let mut value = self.fetch(0, mirror) * scale;
        if self.kernel == KernelKind::BoundaryVector {
            // No flow through the wall
            for axis in 0..self.axes {
                if shift[axis] != 0 {
                    value[axis] = 0.0;
                }
            }
        }
        value
    }

    /// Solid flag from an offsets field bound at `slot`
    fn solid_at(&self, slot: usize, cell: [i32; 3]) -> bool {
        self.fetch(slot, cell).w > 0.5
    }

    /// Whether the face between `cell - axis` and `cell` has fluid on both sides
    fn open_face(&self, slot: usize, cell: [i32; 3], axis: usize) -> bool {
        !self.solid_at(slot, cell) && !self.solid_at(slot, step(cell, axis, -1))
    }

    fn is_solid(&self, cell: [i32; 3]) -> bool {
        let res = self.target.resolution();
        let on_edge = (0..self.axes).any(|axis| cell[axis] == 0 || cell[axis] == res[axis] as i32 - 1);
        on_edge || self.fetch(0, cell).x > 0.0
    }

    // inputs: boundaries
    fn offsets(&self, cell: [i32; 3]) -> Vector4<f32> {
        if !self.is_solid(cell) {
            return zero();
        }

        let res = self.target.resolution();
        let mut offset = [0.0f32; 3];
        for axis in 0..self.axes {
            for by in [-1, 1] {
                let neighbour = step(cell, axis, by);
                let inside = (0..res[axis] as i32).contains(&neighbour[axis]);
                if inside && !self.is_solid(neighbour) {
                    offset[axis] += by as f32;
                }
            }
        }
        Vector4::new(offset[0], offset[1], offset[2], 1.0)
    }

    // inputs: x, b, occupancy, offsets
    fn jacobi(&self, cell: [i32; 3]) -> Vector4<f32> {
        let alpha = self.param(0).x;
        let beta = self.param(1).x;
        let cull = self.param(2).x;
        let neumann = self.param(3).x > 0.5 && !self.solid_at(3, cell);

        let here = self.fetch(0, cell);
        if cull > 0.5 && self.fetch(2, cell).x < 0.5 {
            return here;
        }

        let mut sum = zero();
        for axis in 0..self.axes {
            for by in [-1, 1] {
                let neighbour = step(cell, axis, by);
                sum += if neumann && self.solid_at(3, neighbour) {
                    here
                } else {
                    self.fetch(0, neighbour)
                };
            }
        }
        (sum + self.fetch(1, cell) * alpha) / beta
    }

    // inputs: x, b
    fn zcull(&self, cell: [i32; 3]) -> Vector4<f32> {
        let mut active = non_zero(self.fetch(0, cell)) || non_zero(self.fetch(1, cell));
        for axis in 0..self.axes {
            active = active
                || non_zero(self.fetch(0, step(cell, axis, -1)))
                || non_zero(self.fetch(0, step(cell, axis, 1)));
        }
        if active {
            Vector4::new(1.0, 0.0, 0.0, 0.0)
        } else {
            zero()
        }
    }

    /// Component `axis` of the velocity on the low face of `cell`, zero on walls
    fn face_velocity(&self, cell: [i32; 3], axis: usize) -> f32 {
        if self.open_face(1, cell, axis) {
            self.fetch(0, cell)[axis]
        } else {
            0.0
        }
    }

    // inputs: velocity, offsets
    fn divergence(&self, cell: [i32; 3]) -> Vector4<f32> {
        if self.solid_at(1, cell) {
            return zero();
        }
        let delta = self.param(0);
        let mut divergence = 0.0;
        for axis in 0..self.axes {
            let ahead = self.face_velocity(step(cell, axis, 1), axis);
            divergence += (ahead - self.face_velocity(cell, axis)) / delta[axis];
        }
        Vector4::new(divergence, 0.0, 0.0, 0.0)
    }

    // inputs: velocity, pressure, offsets
    fn subtract_gradient(&self, cell: [i32; 3]) -> Vector4<f32> {
        let delta = self.param(0);
        let mut velocity = self.fetch(0, cell);
        let pressure = self.fetch(1, cell).x;
        for axis in 0..self.axes {
            if self.open_face(2, cell, axis) {
                let behind = self.fetch(1, step(cell, axis, -1)).x;
                velocity[axis] -= (pressure - behind) / delta[axis];
            } else {
                velocity[axis] = 0.0;
            }
        }
        velocity
    }

    fn in_rect(&self, cell: [i32; 3]) -> bool {
        let lo = self.param(0);
        let hi = self.param(1);
        (0..self.axes).all(|axis| {
            let center = cell[axis] as f32 + 0.5;
            center >= lo[axis] && center < hi[axis]
        })
    }

    // inputs: field
    fn splat_ink(&self, cell: [i32; 3]) -> Vector4<f32> {
        let old = self.fetch(0, cell);
        if !self.in_rect(cell) {
            return old;
        }
        let color = self.param(2);
        if color.w > 0.5 {
            Vector4::new(color.x, color.y, color.z, 1.0)
        } else {
            Vector4::new(old.x + color.x, old.y + color.y, old.z + color.z, 1.0)
        }
    }

    // inputs: field
    fn splat_boundary(&self, cell: [i32; 3]) -> Vector4<f32> {
        if self.in_rect(cell) {
            Vector4::new(1.0, 1.0, 1.0, 1.0)
        } else {
            self.fetch(0, cell)
        }
    }

    // inputs: data, velocity, pressure, boundaries
    fn render(&self, cell: [i32; 3]) -> Vector4<f32> {
        let data_scale = self.param(0);
        let solver_scale = self.param(1);
        let layers = self.param(2);
        let solid_grey = Vector3::new(0.5, 0.5, 0.5);

        if self.axes < 3 {
            let mut color = Vector3::new(0.0, 0.0, 0.0);
            let solver_pos = self.rescale(cell, solver_scale);
            if layers.x > 0.5 {
                color += self.sample(0, self.rescale(cell, data_scale)).truncate();
            }
            if layers.y > 0.5 {
                let v = self.sample(1, solver_pos);
                color += Vector3::new(v.x.abs(), v.y.abs(), 0.0);
            }
            if layers.z > 0.5 {
                let p = self.sample(2, solver_pos).x;
                color += Vector3::new(p.max(0.0), 0.0, (-p).max(0.0));
            }
            if layers.w > 0.5 {
                let nearest = [
                    (solver_pos[0] + 0.5).floor() as i32,
                    (solver_pos[1] + 0.5).floor() as i32,
                    0,
                ];
                if self.fetch(3, nearest).x > 0.0 {
                    color = solid_grey;
                }
            }
            return color.extend(1.0);
        }

        // Front-to-back march along +z through the volume
        let depth = self.source.resolution()[2] as i32;
        let x = ((cell[0] as f32 + 0.5) * solver_scale.x).floor() as i32;
        let y = ((cell[1] as f32 + 0.5) * solver_scale.y).floor() as i32;
        let opacity = data_scale.w;

        let mut color = Vector3::new(0.0, 0.0, 0.0);
        let mut alpha = 0.0f32;
        for z in 0..depth {
            let voxel = [x, y, z];
            let (rgb, a) = if layers.w > 0.5 && self.fetch(3, voxel).x > 0.0 {
                (solid_grey, opacity.clamp(0.0, 1.0))
            } else if layers.x > 0.5 {
                let ink = self.fetch(0, voxel).truncate();
                (ink, ((ink.x + ink.y + ink.z) * opacity).clamp(0.0, 1.0))
            } else {
                (Vector3::new(0.0, 0.0, 0.0), 0.0)
            };
            color += rgb * (a * (1.0 - alpha));
            alpha += (1.0 - alpha) * a;
        }

        let middle = [x, y, depth / 2];
        if layers.y > 0.5 {
            let v = self.fetch(1, middle);
            color += Vector3::new(v.x.abs(), v.y.abs(), v.z.abs());
        }
        if layers.z > 0.5 {
            let p = self.fetch(2, middle).x;
            color += Vector3::new(p.max(0.0), 0.0, (-p).max(0.0));
        }
        color.extend(alpha)
    }
}
