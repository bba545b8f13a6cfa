//! Shared data model for the meshline tracer and mesh integrator.

pub mod domain;
pub mod error;
pub mod sampling;

pub use domain::*;
pub use error::*;
pub use sampling::SamplingDecider;
