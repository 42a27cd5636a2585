//! Kiln Runtime
//!
//! Incremental, memoizing compute engine. Work is expressed as a graph of
//! [`Computable`] nodes with declared [`Inputs`]; the [`Orchestrator`]
//! digests those inputs, deduplicates identical work within an invocation,
//! serves repeated work from the content-addressed cache and keeps graphs
//! live with [`continuously`].

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod action;
pub mod builtin;
pub mod codec;
pub mod combinators;
pub mod computable;
pub mod config;
pub mod continuous;
pub mod error;
pub mod inputs;
pub mod metrics;
pub mod orchestrator;
pub mod promise;
pub mod stream;
pub mod throttle;

pub use action::Action;
pub use builtin::{BytesCodec, MessageCodec, StreamCodec, VecCodec};
pub use codec::{Codec, CodecRegistry, Digestible, VersionSender, Versioned};
pub use combinators::{error, inline, map, named, precomputed, sticky, transform};
pub use computable::{AnyComputable, Computable, InstanceState, Output, Resolved, Scope};
pub use config::OrchestratorConfig;
pub use continuous::{Flow, SinkContext, Sinkable, TransformErr, continuously};
pub use error::{ComputeError, ComputeResult, ConfigError};
pub use inputs::{ComputedInputs, InputDigest, Inputs};
pub use metrics::MetricsSnapshot;
pub use orchestrator::{Context, Orchestrator, OrchestratorBuilder};
pub use promise::{AnyValue, Computed, Future, Promise};
pub use stream::ByteStream;
pub use throttle::{Lease, Throttle, ThrottleRule};
