//! MeshSpy: serial mesh radio to pub/sub bridge.
//!
//! Two flows run side by side over one shared bus client:
//!
//! - [`serial`] reads device lines; [`pipeline`] publishes them on the raw topic
//! - [`pipeline`] decodes node telemetry from the telemetry topic and appends
//!   it through [`storage`]
//!
//! # Topics
//!
//! ```text
//! meshspy/raw    <- one message per device line, bytes unmodified
//! meshspy/nodes  -> encoded NodeTelemetry records, stored in node_data
//! ```

pub mod config;
pub mod device_info;
pub mod pipeline;
pub mod serial;
pub mod storage;
