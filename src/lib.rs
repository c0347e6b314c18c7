#![warn(missing_docs)]
#![doc = include_str!("../README.md")]

//! # Molsurf Library
//!
//! This library computes molecular surfaces from atom coordinates and van
//! der Waals radii: a probe sphere is rolled over the atoms, the contact
//! locus is sampled into a dot cloud, refined, and triangulated into a mesh
//! suitable for rendering or downstream geometric analysis.
//!
//! The main entry point is [`SurfaceJob`]: construct one per atom set, call
//! [`SurfaceJob::run`] with a [`RunContext`] (which carries the cooperative
//! interrupt flag and progress counters), and read the mesh out of
//! [`SurfaceJob::result`]. Lower-level pieces (the solvent dot generator,
//! the uniform spatial hash and the triangulator) are exposed for callers
//! that want to drive the pipeline themselves.

mod context;
mod error;
mod geometry;
mod grid;
mod job;
/// Solvent-accessible dot cloud generation.
pub mod solvent;
/// Tessellated unit-sphere sampling templates.
pub mod sphere;
/// Point-cloud triangulation.
pub mod triangulate;

// Re-export key public types
pub use context::{RunContext, Stage};
pub use error::SurfaceError;
pub use grid::SpatialGrid;
pub use job::{QualityTuning, SurfaceJob, SurfaceParams, SurfaceResult};
pub use solvent::{DotSet, SolventDotParams};
pub use sphere::SphereTemplate;
pub use triangulate::Triangulation;
