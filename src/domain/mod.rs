//! Domain types for the observation pipeline.
//!
//! This module contains the core data structures:
//! - Run: one execution of a pipeline and its task results
//! - Results: result trees and their reduction to a singular outcome
//! - Job: job identity and pipeline definitions
//! - Vars: run input variables
//! - Bridge: metadata handed to external adapters
//! - Decimal: conversion of results to observations

pub mod bridge;
pub mod decimal;
pub mod job;
pub mod results;
pub mod run;
pub mod vars;

// Re-export commonly used types
pub use bridge::{marshal_bridge_metadata, BridgeMetaData, MetadataError};
pub use decimal::{to_decimal, to_observation, ConversionError};
pub use job::{JobDefinition, JobSpec, PipelineSpec, TaskSpec};
pub use results::{FinalResult, ResultError, TaskResult, TaskRunResult, TaskRunResults};
pub use run::{Run, RunState};
pub use vars::Vars;
