//! Mapper processes on the local host.

use std::{env, process::Stdio};

use async_trait::async_trait;
use kestrel_common::{manifest::JobManifest, prelude::*, POLL_INTERVAL};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;

use super::{MapperBackend, WorkerHandle};

/// Launches `workers` mapper child processes on this host, with their
/// three standard streams piped to the coordinator.
pub struct LocalBackend {
    command: Vec<String>,
    workers: usize,
}

impl LocalBackend {
    /// A backend running `kestrel-map <config>` per worker slot.
    pub fn new(manifest: &JobManifest, config_path: &Path) -> LocalBackend {
        LocalBackend {
            command: vec![
                sibling_program("kestrel-map"),
                config_path.display().to_string(),
            ],
            workers: manifest.workers,
        }
    }

    /// A backend running an arbitrary mapper command. Used by tests to
    /// substitute scripted mappers.
    pub fn with_command(command: Vec<String>, workers: usize) -> LocalBackend {
        LocalBackend { command, workers }
    }
}

#[async_trait]
impl MapperBackend for LocalBackend {
    async fn start(&mut self, abort: &CancellationToken) -> Result<Vec<WorkerHandle>> {
        (0..self.workers)
            .map(|worker_id| spawn_mapper(&self.command, worker_id, abort))
            .collect()
    }

    async fn shutdown(&mut self) -> Result<()> {
        // Children are reaped by their exit watchers; nothing to
        // release here.
        Ok(())
    }
}

/// Prefer a tool installed next to this binary, falling back to `$PATH`.
pub fn sibling_program(name: &str) -> String {
    if let Ok(exe) = env::current_exe() {
        if let Some(dir) = exe.parent() {
            let candidate = dir.join(name);
            if candidate.is_file() {
                return candidate.display().to_string();
            }
        }
    }
    name.to_owned()
}

#[instrument(skip_all, fields(worker_id = worker_id), level = "debug")]
fn spawn_mapper(
    command: &[String],
    worker_id: usize,
    abort: &CancellationToken,
) -> Result<WorkerHandle> {
    let mut cmd = Command::new(&command[0]);
    cmd.args(&command[1..])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    // Keep workers out of the terminal's process group, so an
    // interactive ctrl-c reaches only the coordinator and shutdown
    // stays ordered.
    #[cfg(unix)]
    cmd.process_group(0);
    let mut child = cmd
        .spawn()
        .with_context(|| format!("could not run {:?}", command[0]))?;

    let input = child.stdin.take().expect("child should always have a stdin");
    let data = child
        .stdout
        .take()
        .expect("child should always have a stdout");
    let control = child
        .stderr
        .take()
        .expect("child should always have a stderr");
    let pid = child.id();

    let abort = abort.clone();
    let exit = tokio::spawn(async move { wait_for_mapper(child, abort).await });

    Ok(WorkerHandle {
        worker_id,
        input: Box::new(input),
        data: Box::new(data),
        control: Box::new(control),
        exit,
        pid,
    })
}

/// Wait for a mapper to exit. Once abort is set, the mapper gets one
/// poll interval to finish its current file before it is killed, so
/// shutdown is always bounded.
async fn wait_for_mapper(mut child: Child, abort: CancellationToken) -> Result<i32> {
    tokio::select! {
        status = child.wait() => {
            Ok(status.context("error waiting for mapper")?.code().unwrap_or(-1))
        }
        _ = abort.cancelled() => {
            match tokio::time::timeout(POLL_INTERVAL, child.wait()).await {
                Ok(status) => {
                    Ok(status.context("error waiting for mapper")?.code().unwrap_or(-1))
                }
                Err(_elapsed) => {
                    warn!("mapper did not exit after abort, killing it");
                    child.kill().await.context("could not kill mapper")?;
                    Ok(child
                        .wait()
                        .await
                        .context("error waiting for killed mapper")?
                        .code()
                        .unwrap_or(-1))
                }
            }
        }
    }
}
