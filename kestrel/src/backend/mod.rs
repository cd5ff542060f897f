//! Execution backends for mapper workers.
//!
//! A backend starts N mapper processes somewhere (as children on this
//! host, or over shell channels on provisioned instances) and hands
//! each back as a [`WorkerHandle`], so the coordinator's dispatch logic
//! never cares where a mapper runs.

use async_trait::async_trait;
use kestrel_common::prelude::*;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

pub mod ec2;
pub mod local;

/// A running mapper, as seen by the coordinator.
pub struct WorkerHandle {
    /// Stable index of this mapper within the job.
    pub worker_id: usize,

    /// The mapper's input stream. Call `shutdown` before dropping:
    /// for a remote channel, dropping the writer alone does not signal
    /// end-of-stream; the shutdown issues the explicit half-close.
    pub input: Box<dyn AsyncWrite + Send + Unpin>,

    /// The mapper's `DATA` stream.
    pub data: Box<dyn AsyncRead + Send + Unpin>,

    /// The mapper's `CONTROL` stream.
    pub control: Box<dyn AsyncRead + Send + Unpin>,

    /// Resolves to the mapper's exit status once it has terminated.
    pub exit: JoinHandle<Result<i32>>,

    /// OS pid, when the mapper is a child process on this host.
    pub pid: Option<u32>,
}

impl fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("worker_id", &self.worker_id)
            .field("pid", &self.pid)
            .finish()
    }
}

/// A strategy for running mapper processes.
#[async_trait]
pub trait MapperBackend: Send {
    /// Provision whatever the backend needs and start every mapper.
    async fn start(&mut self, abort: &CancellationToken) -> Result<Vec<WorkerHandle>>;

    /// Release the backend's resources. Called on every exit path,
    /// including errors from [`MapperBackend::start`]; must be safe to
    /// call more than once.
    async fn shutdown(&mut self) -> Result<()>;
}
