//! A GPU-accelerated node-graph engine for image and keypoint pipelines:
//! wire typed [`node::NodeBehavior`]s into a [`pipeline::Pipeline`], `init`
//! it against a [`device::DeviceContext`], and `run` it to drive a frame
//! from its sources to its single designated sink.
//!
//! Mirrors the teacher's module split (`program`/`pool`/`buffer` become
//! `pipeline`/`texture`/`value` here) but replaces its single-sink
//! image-editing SSA DSL with the node/port graph `pipeline` builds and
//! schedules, per the module layout `DESIGN.md` records.

pub mod config;
pub mod device;
pub mod error;
pub mod keypoint;
pub mod matrix;
pub mod media;
pub mod node;
pub mod pipeline;
pub mod port;
pub mod reader;
pub mod texture;
pub mod value;

pub use config::EngineConfig;
pub use device::{DeviceContext, KernelProgram};
pub use error::{EngineError, IllegalOperationError, ResourceError, ValidationError};
pub use media::{ImageMedia, Media};
pub use node::{NodeBehavior, NodeContext, NodeKind};
pub use pipeline::{NodeId, Pipeline, PipelineOutput, PortRef};
pub use port::{Message, MessageKind, PortDirection, PortSpec};
pub use value::{Keypoint, Point, Rectangle, Size, Vector2};
