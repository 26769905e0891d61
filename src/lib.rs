//! Acceleration-structure and ray tracing pipeline management for the
//! "Intro to DirectX Raytracing" samples.

pub mod blas;
pub mod camera;
pub mod cli;
pub mod context;
pub mod descriptors;
pub mod device;
pub mod dispatch;
pub mod error;
pub mod frame;
pub mod geometry;
pub mod instance;
pub mod pipeline;
pub mod renderer;
pub mod samples;
pub mod scene;
pub mod tlas;

pub use error::{fatal, ContractViolation, Error, OrFatal, Policy, Result};
