//! Core crate for the tagsight vision pipeline: graph compilation, the
//! frame-processing runtime, and camera/file orchestration.

pub mod builder;
pub mod camera;
pub mod compile;
pub mod config;
pub mod discovery;
pub mod error;
pub mod graph;
pub mod logging;
pub mod manager;
pub mod media;
pub mod pipeline;
pub mod registry;
pub mod service;
pub mod sink;
pub mod stage;
pub mod tap;
pub mod types;
