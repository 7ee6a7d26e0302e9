//! Declared parameters of every kernel
//!
//! Texture parameters occupy input slots and vector parameters occupy
//! uniform slots, both in declaration order. The WGSL entry points read them
//! by slot, so these tables and `fluid.wgsl` must agree.

use super::KernelKind;

/// Names a kernel accepts, in slot order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelSignature {
    pub textures: &'static [&'static str],
    pub vectors: &'static [&'static str],
}

impl KernelSignature {
    pub fn texture_slot(&self, name: &str) -> Option<usize> {
        self.textures.iter().position(|&n| n == name)
    }

    pub fn vector_slot(&self, name: &str) -> Option<usize> {
        self.vectors.iter().position(|&n| n == name)
    }
}

const fn sig(
    textures: &'static [&'static str],
    vectors: &'static [&'static str],
) -> KernelSignature {
    KernelSignature { textures, vectors }
}

pub fn signature(kind: KernelKind) -> KernelSignature {
    match kind {
        KernelKind::Copy => sig(&["source"], &[]),
        KernelKind::Advect => sig(
            &["velocity", "data", "boundaries"],
            &["delta", "scale", "timestep"],
        ),
        KernelKind::Vorticity => sig(&["velocity"], &["delta", "epsilon", "timestep"]),
        KernelKind::SplatVelocity => sig(&["field"], &["position", "velocity", "radius"]),
        KernelKind::Buoyancy => sig(
            &["velocity", "data"],
            &["scale", "densities", "timestep"],
        ),
        KernelKind::BoundaryScalar | KernelKind::BoundaryVector => {
            sig(&["field", "offsets"], &["scale"])
        }
        KernelKind::Offsets => sig(&["boundaries"], &[]),
        KernelKind::JacobiScalar | KernelKind::JacobiVector => {
            sig(&["x", "b", "occupancy", "offsets"], &["alpha", "beta", "cull", "neumann"])
        }
        KernelKind::ZCull => sig(&["x", "b"], &[]),
        KernelKind::Divergence => sig(&["velocity", "offsets"], &["delta"]),
        KernelKind::SubtractGradient => sig(&["velocity", "pressure", "offsets"], &["delta"]),
        KernelKind::SplatInk => sig(&["field"], &["rect_min", "rect_max", "color"]),
        KernelKind::SplatBoundary => sig(&["field"], &["rect_min", "rect_max"]),
        KernelKind::Render => sig(
            &["data", "velocity", "pressure", "boundaries"],
            &["data_scale", "solver_scale", "layers"],
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernels::{MAX_TEXTURE_INPUTS, MAX_VECTOR_PARAMS};

    #[test]
    fn test_signatures_fit_binding_slots() {
        for kind in KernelKind::ALL {
            let signature = signature(kind);
            assert!(signature.textures.len() <= MAX_TEXTURE_INPUTS, "{kind:?}");
            assert!(signature.vectors.len() <= MAX_VECTOR_PARAMS, "{kind:?}");
        }
    }

    #[test]
    fn test_slots_follow_declaration_order() {
        let advect = signature(KernelKind::Advect);
        assert_eq!(advect.texture_slot("boundaries"), Some(2));
        assert_eq!(advect.vector_slot("timestep"), Some(2));
        assert_eq!(advect.vector_slot("viscosity"), None);
    }
}
