//! Tollgate - Token-Bucket Admission Control
//!
//! This crate gates admission of caller-identified work with a token-bucket
//! algorithm whose per-key state lives behind a pluggable store. A single
//! process can keep state in memory; several instances can share one
//! `tollgate store` server, which applies every take atomically on its side.

pub mod admission;
pub mod bucket;
pub mod clock;
pub mod config;
pub mod error;
pub mod grpc;
pub mod store;
