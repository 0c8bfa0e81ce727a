//! Host-side orchestration for GPU particle simulations.
//!
//! [`particles::ParticleSim`] owns two ping-pong particle state buffers and a
//! render position buffer, runs an ordered pipeline of compute kernels each
//! frame and submits one instanced draw of the result. Devices plug in
//! through the traits in [`backend`].

pub mod backend;
pub mod particles;
