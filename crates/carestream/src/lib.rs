//! Carestream - SSE relay for care-plan generation backends
//!
//! This crate provides a small HTTP service that sits between a browser
//! client and a care-plan generation backend. It reconstructs well-formed
//! SSE events from arbitrarily-chunked upstream bytes, applies per-type
//! payload repairs, and forwards each event downstream in SSE wire format.

pub mod config;
pub mod error;
pub mod relay;

pub use error::CarestreamError;
