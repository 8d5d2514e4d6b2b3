//! Atlaspub Core - Domain types and contracts for map publishing
//!
//! This crate contains the ports-and-adapters core with:
//! - **Domain entities** - `Credentials`, `User`, `Workspace`, `Map`, `LayerPackage`
//! - **Port definitions** - Traits for adapters: `TokenStorage`, `LayerSource`
//! - **Progress feedback** - `MultiStepFeedback`, the progress/cancellation contract
//!   shared by every stage of a publish run
//! - **Configuration** - YAML-backed settings with validation
//!
//! # Architecture
//!
//! The domain module holds plain value types with no I/O. Ports define the
//! trait interfaces that adapter crates (`atlaspub-api`, `atlaspub-publish`)
//! implement or consume.

pub mod config;
pub mod domain;
pub mod feedback;
pub mod ports;
