//! Volustream — looping volumetric frame-sequence streaming pipeline.
//!
//! Streams a fixed sequence of numbered, compressed point-cloud frames
//! from an HTTP server via batched external curl invocations, decodes them
//! into renderable buffers, and presents them to a render sink in strict
//! index order at a target frame rate, looping indefinitely.

pub mod codec;
pub mod config;
pub mod control;
pub mod fetch;
pub mod pipeline;
pub mod registry;
pub mod sink;

pub use codec::{FrameCodec, Lz4PointCodec, PointCloud};
pub use config::{PipelineConfig, SourceConfig};
pub use control::ControlCommand;
pub use fetch::{CurlFetcher, FetchBatch, FetchItem, Fetcher};
pub use pipeline::{Pipeline, PipelineEvent};
pub use registry::{FrameRegistry, FrameState};
pub use sink::{LogSink, RenderSink};
