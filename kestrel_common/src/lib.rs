//! Code shared between the kestrel coordinator and its worker tools.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub use chrono;
pub use serde;
pub use serde_json;
pub use tokio;
pub use tracing;

pub mod control;
pub mod error;
pub mod manifest;
pub mod progress;
pub mod resolver;
pub mod storage;
pub mod tracing_support;

/// Common imports used by many modules.
pub mod prelude {
    pub use std::{
        collections::HashMap,
        fmt,
        path::{Path, PathBuf},
        time::Duration,
    };

    pub use anyhow::{format_err, Context};
    pub use serde::{Deserialize, Serialize};
    pub use tracing::{
        debug, debug_span, error, error_span, info, info_span, instrument, trace,
        trace_span, warn, warn_span,
    };

    pub use super::{error::RunnerError, Error, Result};
}

/// Error type for this crate's functions.
pub use anyhow::Error;
/// Result type for this crate's functions.
pub use anyhow::Result;

/// How long a task may block before re-checking the abort latch. Every
/// queue wait and poll loop in the runner is bounded by this.
pub const POLL_INTERVAL: std::time::Duration = std::time::Duration::from_secs(2);

/// The version of `kestrel_common` that we're using. This can be used to
/// make sure the coordinator and the worker tools on a remote instance
/// match.
pub fn kestrel_common_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
