//! Classified fatal errors.
//!
//! Per-file failures never appear here: a mapper reports those on its
//! `CONTROL` stream and the coordinator requeues the file. Everything in
//! this module ends the job. These values are attached to `anyhow` error
//! chains as context, so callers can `downcast_ref::<RunnerError>()` to
//! classify a failure without losing the underlying cause.

use thiserror::Error;

/// A fatal, job-level failure.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum RunnerError {
    /// The job manifest defines no input URIs.
    #[error("no input URIs defined in the job manifest")]
    InputMissing,

    /// Listing an input URI failed.
    #[error("could not list input at {uri}")]
    BackendUnavailable {
        /// The URI we could not list.
        uri: String,
    },

    /// An instance never reached `running`, or never accepted a shell
    /// connection.
    #[error("could not provision instance {instance_id}")]
    ProvisionFailed {
        /// The instance that failed to come up.
        instance_id: String,
    },

    /// A remote bootstrap command exited nonzero.
    #[error("command {command:?} exited with status {status} on instance {instance_id}")]
    BootstrapFailed {
        /// The instance the command ran on.
        instance_id: String,
        /// The command that failed.
        command: String,
        /// Its exit status.
        status: i32,
    },
}
