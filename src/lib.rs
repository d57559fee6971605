//! Granular is the parallel core of a discrete element (DEM) simulation. It
//! keeps the registry of pairwise body interactions, partitions bodies across
//! ranks as subdomains that exchange state with their neighbors each step,
//! and couples particles to an external fluid solver running on separate
//! ranks. Ranks talk through a minimal `Communicator` trait, implemented
//! in-process over channels and across hosts over TCP.

pub mod adjacency;
pub mod body;
pub mod collider;
pub mod config;
pub mod coupling;
pub mod error;
pub mod forces;
pub mod geometry;
pub mod interaction;
pub mod interaction_container;
pub mod message;
pub mod parallel;
pub mod scene;
pub mod subdomain;

pub use error::{Error, Result};
