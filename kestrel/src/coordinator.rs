//! The job coordinator.
//!
//! Fans input files out to mapper workers, fans their `DATA` streams in
//! to the single reducer, tracks progress from their `CONTROL` streams,
//! and owns the job lifecycle: resolve → provision → stream → drain →
//! terminate. The abort latch is a one-way `CancellationToken` observed
//! by every task; each blocking wait here is bounded so abort always
//! becomes observable.

use std::{
    process::Stdio,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use async_channel::{Receiver, Sender};
use kestrel_common::{
    control::{ControlRecord, ControlStatus},
    manifest::JobManifest,
    prelude::*,
    progress::ProgressTracker,
    resolver::{self, WorkItem},
    POLL_INTERVAL,
};
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader},
    process::{Child, ChildStdin, Command},
    sync::mpsc,
    task::JoinHandle,
    time::timeout,
};
use tokio_util::sync::CancellationToken;

use crate::{
    backend::{MapperBackend, WorkerHandle},
    dashboard,
};

/// Cap on buffered `DATA` records. A full queue back-pressures mappers
/// through their pipes instead of buffering unbounded output in memory.
const DATA_QUEUE_CAPACITY: usize = 10_000;

/// How long we wait for the reducer to finalize after an abort.
const REDUCER_GRACE: Duration = Duration::from_secs(30);

/// Terminal job states.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Outcome {
    /// Every file drained and the reducer exited zero.
    Success,
    /// The user asked us to stop.
    UserAborted,
    /// A mapper exited nonzero before its stream drained.
    WorkerFailed,
    /// The reducer died mid-stream or exited nonzero.
    ReducerFailed,
}

/// Everything the coordinator needs to run one job.
pub struct Job {
    /// The job manifest, immutable for the lifetime of the job.
    pub manifest: Arc<JobManifest>,
    /// Shared progress state, written only by our event consumer.
    pub progress: ProgressTracker,
    /// The one-way abort latch.
    pub abort: CancellationToken,
    /// Where the reducer's artifact is written.
    pub output_path: PathBuf,
    /// How to launch the reducer worker.
    pub reducer_command: Vec<String>,
}

/// Run one job to a terminal state.
///
/// The caller owns backend shutdown: it must call
/// [`MapperBackend::shutdown`] afterwards on every path, including when
/// this returns an error.
pub async fn run_job(job: &Job, backend: &mut dyn MapperBackend) -> Result<Outcome> {
    // RESOLVING
    let resolved = resolver::resolve(&job.manifest).await?;
    if resolved.items.is_empty() {
        return Err(format_err!("no input files matched the job's input URIs"));
    }
    info!("going to process {} files...", resolved.items.len());
    job.progress
        .set_totals(resolved.items.len() as u64, resolved.bytes_total);

    let sizes: Arc<HashMap<String, u64>> = Arc::new(
        resolved
            .items
            .iter()
            .map(|item| (item.uri.clone(), item.size))
            .collect(),
    );

    // The input queue. Capacity equals the initial item count, which
    // also accommodates requeues: a file is always removed before it
    // can be re-enqueued, so the queue never exceeds its original
    // high-water mark.
    let (input_tx, input_rx) = async_channel::bounded(resolved.items.len());
    for item in &resolved.items {
        input_tx
            .send(item.clone())
            .await
            .map_err(|_| format_err!("input queue closed unexpectedly"))?;
    }

    let (data_tx, data_rx) = async_channel::bounded::<String>(DATA_QUEUE_CAPACITY);
    let (event_tx, event_rx) = mpsc::channel::<ControlEvent>(256);
    let remaining = Arc::new(AtomicUsize::new(resolved.items.len()));
    let worker_failed = Arc::new(AtomicBool::new(false));
    let user_aborted = Arc::new(AtomicBool::new(false));
    let reducer_died = Arc::new(AtomicBool::new(false));

    // PROVISIONING
    let workers = backend.start(&job.abort).await?;
    info!("started {} mappers", workers.len());

    let mut reducer = spawn_reducer(&job.reducer_command, &job.output_path)?;
    let reducer_stdin = reducer
        .stdin
        .take()
        .expect("reducer should always have a stdin");
    let reducer_stderr = reducer
        .stderr
        .take()
        .expect("reducer should always have a stderr");
    let reducer_pid = reducer.id();

    // STREAMING
    let dashboard_task = if job.manifest.output_job_progress {
        dashboard::spawn(dashboard::Dashboard {
            progress: job.progress.clone(),
            abort: job.abort.clone(),
            config: job.manifest.dashboard.clone(),
            mapper_pids: workers.iter().map(|w| w.pid).collect(),
            reducer_pid,
            output_path: job.output_path.clone(),
        })
    } else {
        None
    };

    spawn_signal_watcher(
        job.abort.clone(),
        user_aborted.clone(),
        event_tx.clone(),
    );

    let dispatch = Dispatch {
        input_tx,
        input_rx,
        events: event_tx.clone(),
        remaining,
        attempts: Arc::new(Mutex::new(HashMap::new())),
        sizes,
        max_retries: job.manifest.max_retries,
        abort: job.abort.clone(),
    };

    let mut control_tasks = Vec::new();
    let mut data_tasks = Vec::new();
    let mut exit_tasks = Vec::new();
    for handle in workers {
        let WorkerHandle {
            worker_id,
            input,
            data,
            control,
            exit,
            ..
        } = handle;
        control_tasks.push(tokio::spawn(control_loop(
            worker_id,
            input,
            control,
            dispatch.clone(),
        )));
        data_tasks.push(tokio::spawn(data_loop(data, data_tx.clone())));
        exit_tasks.push(tokio::spawn(watch_mapper_exit(
            worker_id,
            exit,
            worker_failed.clone(),
            job.abort.clone(),
        )));
    }
    drop(data_tx);
    drop(dispatch);

    let progress_task = tokio::spawn(consume_events(event_rx, job.progress.clone()));
    let stderr_task =
        tokio::spawn(forward_reducer_stderr(reducer_stderr, event_tx.clone()));
    let feeder = tokio::spawn(feed_reducer(
        reducer,
        reducer_stdin,
        data_rx,
        job.abort.clone(),
        reducer_died.clone(),
    ));

    // Completion detection: a CONTROL reader finishing implies its
    // mapper closed CONTROL (or abort was observed).
    for task in control_tasks {
        if let Err(err) = task.await.context("control reader panicked")? {
            // A dead mapper surfaces here as a broken pipe; its exit
            // watcher decides whether that is fatal.
            warn!("control reader failed: {:?}", err);
        }
    }
    for task in data_tasks {
        if let Err(err) = task.await.context("data reader panicked")? {
            warn!("data reader failed: {:?}", err);
        }
    }
    for task in exit_tasks {
        task.await.context("exit watcher panicked")?;
    }

    // Every DATA sender is gone now, so the feeder finishes once the
    // queue has drained into the reducer.
    let (mut reducer, reducer_stdin) =
        feeder.await.context("reducer feeder panicked")?;

    let aborted_early = job.abort.is_cancelled();

    // DRAINING: release the dashboard, then close the reducer's input
    // so its finalizer runs exactly once.
    job.abort.cancel();
    if let Some(task) = dashboard_task {
        let _ = task.await;
    }
    drop(reducer_stdin);
    let reducer_status = wait_for_reducer(&mut reducer, aborted_early).await?;

    let _ = stderr_task.await;
    drop(event_tx);
    let _ = progress_task.await;

    let outcome = if worker_failed.load(Ordering::SeqCst) {
        Outcome::WorkerFailed
    } else if reducer_died.load(Ordering::SeqCst) {
        Outcome::ReducerFailed
    } else if user_aborted.load(Ordering::SeqCst) || aborted_early {
        Outcome::UserAborted
    } else if reducer_status != 0 {
        error!("reduce process exited with status {}", reducer_status);
        Outcome::ReducerFailed
    } else {
        Outcome::Success
    };
    Ok(outcome)
}

/// One control event per mapper report, consumed by the single task
/// allowed to write progress state.
enum ControlEvent {
    /// A file was processed successfully.
    Processed {
        /// The file's URI.
        uri: String,
        /// Its reported byte size.
        size: u64,
    },
    /// A file failed and went back on the input queue.
    Requeued {
        /// The file's URI.
        uri: String,
        /// How many times it has failed so far.
        attempt: u32,
    },
    /// A file exhausted its retries.
    Exhausted {
        /// The file's URI.
        uri: String,
    },
    /// A freeform diagnostic.
    Message(String),
}

/// Shared dispatch state for the per-mapper CONTROL readers.
#[derive(Clone)]
struct Dispatch {
    input_tx: Sender<WorkItem>,
    input_rx: Receiver<WorkItem>,
    events: mpsc::Sender<ControlEvent>,
    remaining: Arc<AtomicUsize>,
    attempts: Arc<Mutex<HashMap<String, u32>>>,
    sizes: Arc<HashMap<String, u64>>,
    max_retries: u32,
    abort: CancellationToken,
}

impl Dispatch {
    /// Apply one control record: account a success, or requeue a
    /// failure until its retries run out.
    async fn handle_record(&self, record: ControlRecord) {
        match record.status {
            ControlStatus::Processed => {
                debug!("successfully processed {}", record.uri);
                self.lock_attempts().remove(&record.uri);
                self.remaining.fetch_sub(1, Ordering::SeqCst);
                let _ = self
                    .events
                    .send(ControlEvent::Processed {
                        uri: record.uri,
                        size: record.size,
                    })
                    .await;
            }
            ControlStatus::Failed => {
                let attempt = {
                    let mut attempts = self.lock_attempts();
                    let entry = attempts.entry(record.uri.clone()).or_insert(0);
                    *entry += 1;
                    *entry
                };
                if attempt >= self.max_retries {
                    warn!("giving up on {} after {} attempts", record.uri, attempt);
                    self.remaining.fetch_sub(1, Ordering::SeqCst);
                    let _ = self
                        .events
                        .send(ControlEvent::Exhausted { uri: record.uri })
                        .await;
                } else {
                    warn!("error processing {}, requeuing...", record.uri);
                    let size = self.sizes.get(&record.uri).copied().unwrap_or(0);
                    let _ = self
                        .events
                        .send(ControlEvent::Requeued {
                            uri: record.uri.clone(),
                            attempt,
                        })
                        .await;
                    // The file was removed from the queue when it was
                    // handed to the mapper, so this send stays within
                    // the queue's capacity.
                    let _ = self
                        .input_tx
                        .send(WorkItem {
                            uri: record.uri,
                            size,
                        })
                        .await;
                }
            }
        }
    }

    fn lock_attempts(&self) -> std::sync::MutexGuard<'_, HashMap<String, u32>> {
        self.attempts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// The per-mapper CONTROL reader/writer.
///
/// Primes the mapper with its first file before any control line is
/// read, then alternates: consume one control record, hand out the next
/// file. Closes the mapper's input when the queue is empty and the
/// stream is drained, or when abort is set.
async fn control_loop(
    worker_id: usize,
    mut input: Box<dyn AsyncWrite + Send + Unpin>,
    control: Box<dyn AsyncRead + Send + Unpin>,
    dispatch: Dispatch,
) -> Result<()> {
    let mut lines = BufReader::new(control).lines();

    if !write_next_uri(&mut input, &dispatch).await? {
        half_close(&mut input).await;
        return Ok(());
    }

    loop {
        let line = tokio::select! {
            line = lines.next_line() => {
                line.context("error reading mapper control stream")?
            }
            _ = dispatch.abort.cancelled() => break,
        };
        let line = match line {
            Some(line) => line,
            None => break,
        };

        match ControlRecord::parse(&line) {
            Ok(record) => dispatch.handle_record(record).await,
            Err(_) => {
                warn!("invalid message received from mapper: {}", line);
                let _ = dispatch
                    .events
                    .send(ControlEvent::Message(format!(
                        "mapper {}: {}",
                        worker_id, line
                    )))
                    .await;
            }
        }

        if !write_next_uri(&mut input, &dispatch).await? {
            break;
        }
    }
    half_close(&mut input).await;
    Ok(())
}

/// Hand the next file to a mapper.
///
/// Returns `Ok(false)` when there is nothing left to hand out (the
/// stream is drained, or abort is set) and the mapper should be closed.
/// An undeliverable file goes back on the queue before the error
/// surfaces, so another mapper can pick it up.
async fn write_next_uri(
    input: &mut (impl AsyncWrite + Unpin),
    dispatch: &Dispatch,
) -> Result<bool> {
    loop {
        if dispatch.abort.is_cancelled() {
            return Ok(false);
        }
        if dispatch.remaining.load(Ordering::SeqCst) == 0 {
            return Ok(false);
        }
        match timeout(POLL_INTERVAL, dispatch.input_rx.recv()).await {
            Ok(Ok(item)) => {
                let line = format!("{}\n", item.uri);
                if let Err(err) = input.write_all(line.as_bytes()).await {
                    let _ = dispatch.input_tx.send(item).await;
                    return Err(err).context("error writing to mapper input");
                }
                input.flush().await.context("error flushing mapper input")?;
                return Ok(true);
            }
            Ok(Err(_closed)) => return Ok(false),
            Err(_elapsed) => {
                // Files may still be in flight at other mappers and
                // could yet be requeued; poll again.
            }
        }
    }
}

/// Half-close a mapper's input. For a remote channel the shutdown sends
/// the explicit EOF; a local pipe closes when the writer drops.
async fn half_close(input: &mut (impl AsyncWrite + Unpin)) {
    if let Err(err) = input.shutdown().await {
        debug!("error closing mapper input: {}", err);
    }
}

/// The per-mapper DATA reader: forward every line into the shared data
/// queue in arrival order, including a final line the mapper failed to
/// terminate before exiting.
async fn data_loop(
    data: Box<dyn AsyncRead + Send + Unpin>,
    records: Sender<String>,
) -> Result<()> {
    let mut reader = BufReader::new(data);
    let mut line = String::new();
    loop {
        line.clear();
        let n = reader
            .read_line(&mut line)
            .await
            .context("error reading mapper data stream")?;
        if n == 0 {
            break;
        }
        if line.ends_with('\n') {
            line.pop();
        }
        if records.send(line.clone()).await.is_err() {
            break;
        }
    }
    Ok(())
}

/// The single fan-in task: drain the data queue into the reducer in
/// FIFO order, checking after every write that the reducer is alive.
async fn feed_reducer(
    mut reducer: Child,
    mut stdin: ChildStdin,
    records: Receiver<String>,
    abort: CancellationToken,
    reducer_died: Arc<AtomicBool>,
) -> (Child, ChildStdin) {
    loop {
        let mut record = tokio::select! {
            biased;
            _ = abort.cancelled() => break,
            record = records.recv() => match record {
                Ok(record) => record,
                Err(_drained) => break,
            },
        };
        record.push('\n');
        if let Err(err) = stdin.write_all(record.as_bytes()).await {
            warn!("could not write to reduce process: {}", err);
            reducer_died.store(true, Ordering::SeqCst);
            abort.cancel();
            break;
        }
        match reducer.try_wait() {
            Ok(Some(status)) => {
                error!("reduce process exited early with {}", status);
                reducer_died.store(true, Ordering::SeqCst);
                abort.cancel();
                break;
            }
            Ok(None) => {}
            Err(err) => warn!("could not poll reduce process: {}", err),
        }
    }
    (reducer, stdin)
}

/// Watch one mapper's exit status. A nonzero exit before abort is a
/// worker failure and aborts the job; during shutdown it is expected.
async fn watch_mapper_exit(
    worker_id: usize,
    exit: JoinHandle<Result<i32>>,
    worker_failed: Arc<AtomicBool>,
    abort: CancellationToken,
) {
    let result = match exit.await {
        Ok(result) => result,
        Err(err) => {
            error!("mapper {} exit watcher panicked: {}", worker_id, err);
            return;
        }
    };
    match result {
        Ok(0) => debug!("mapper {} exited cleanly", worker_id),
        Ok(code) => {
            if abort.is_cancelled() {
                debug!(
                    "mapper {} exited with code {} during shutdown",
                    worker_id, code
                );
            } else {
                error!("map process {} exited with code {}", worker_id, code);
                worker_failed.store(true, Ordering::SeqCst);
                abort.cancel();
            }
        }
        Err(err) => {
            error!("could not wait for mapper {}: {:?}", worker_id, err);
            if !abort.is_cancelled() {
                worker_failed.store(true, Ordering::SeqCst);
                abort.cancel();
            }
        }
    }
}

/// The only task allowed to write progress state.
async fn consume_events(
    mut events: mpsc::Receiver<ControlEvent>,
    progress: ProgressTracker,
) {
    while let Some(event) = events.recv().await {
        match event {
            ControlEvent::Processed { uri, size } => {
                progress.record_processed(&uri, size);
            }
            ControlEvent::Requeued { uri, attempt } => {
                progress.push_message(format!(
                    "error processing {} (attempt {}), requeuing...",
                    uri, attempt
                ));
            }
            ControlEvent::Exhausted { uri } => {
                progress.record_failed(&uri);
                progress.push_message(format!("giving up on {}", uri));
            }
            ControlEvent::Message(message) => progress.push_message(message),
        }
    }
}

/// Forward the reducer's stderr into the diagnostic log.
async fn forward_reducer_stderr(
    stderr: impl AsyncRead + Unpin,
    events: mpsc::Sender<ControlEvent>,
) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let _ = events
            .send(ControlEvent::Message(format!("reduce: {}", line)))
            .await;
    }
}

/// A keyboard interrupt sets abort; everything else follows from that.
fn spawn_signal_watcher(
    abort: CancellationToken,
    user_aborted: Arc<AtomicBool>,
    events: mpsc::Sender<ControlEvent>,
) {
    tokio::spawn(async move {
        tokio::select! {
            _ = abort.cancelled() => {}
            result = tokio::signal::ctrl_c() => {
                if result.is_ok() {
                    user_aborted.store(true, Ordering::SeqCst);
                    let _ = events
                        .send(ControlEvent::Message("user abort requested".to_owned()))
                        .await;
                    abort.cancel();
                }
            }
        }
    });
}

/// Spawn the reducer with its stdout pointed at the artifact file.
fn spawn_reducer(command: &[String], output_path: &Path) -> Result<Child> {
    if let Some(dir) = output_path.parent() {
        if !dir.as_os_str().is_empty() {
            std::fs::create_dir_all(dir).with_context(|| {
                format!("could not create output directory {}", dir.display())
            })?;
        }
    }
    let artifact = std::fs::File::create(output_path).with_context(|| {
        format!("could not create output file {}", output_path.display())
    })?;

    let mut cmd = Command::new(&command[0]);
    cmd.args(&command[1..])
        .stdin(Stdio::piped())
        .stdout(Stdio::from(artifact))
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0);
    cmd.spawn()
        .with_context(|| format!("could not run {:?}", command[0]))
}

/// Wait for the reducer to exit. After an abort the wait is
/// best-effort: the reducer gets a grace period to finalize, then is
/// killed.
async fn wait_for_reducer(reducer: &mut Child, aborted: bool) -> Result<i32> {
    if !aborted {
        return Ok(reducer
            .wait()
            .await
            .context("error waiting for reduce process")?
            .code()
            .unwrap_or(-1));
    }
    match timeout(REDUCER_GRACE, reducer.wait()).await {
        Ok(status) => Ok(status
            .context("error waiting for reduce process")?
            .code()
            .unwrap_or(-1)),
        Err(_elapsed) => {
            warn!("reduce process did not finalize after abort, killing it");
            reducer.kill().await.context("could not kill reduce process")?;
            Ok(reducer
                .wait()
                .await
                .context("error waiting for killed reduce process")?
                .code()
                .unwrap_or(-1))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use kestrel_common::serde_json;

    use super::*;
    use crate::backend::local::LocalBackend;

    /// A scripted mapper that emits each file's lines as records.
    const CAT_MAPPER: &str = r#"
while IFS= read -r uri; do
  path="${uri#file://}"
  cat "$path"
  size=$(wc -c < "$path" | tr -d '[:space:]')
  printf '+,%s,%s\n' "$size" "$uri" >&2
done
"#;

    fn sh(script: &str) -> Vec<String> {
        vec![
            "/bin/sh".to_owned(),
            "-c".to_owned(),
            script.to_owned(),
            "mapper".to_owned(),
        ]
    }

    fn test_manifest(input: Vec<String>, max_retries: u32) -> Arc<JobManifest> {
        let mut manifest: JobManifest = serde_json::from_str(
            r#"{"input": [], "map_command": ["true"], "output_job_progress": false}"#,
        )
        .expect("manifest should parse");
        manifest.input = input;
        manifest.max_retries = max_retries;
        Arc::new(manifest)
    }

    fn test_job(manifest: Arc<JobManifest>, output_path: PathBuf) -> Job {
        Job {
            manifest,
            progress: ProgressTracker::new(),
            abort: CancellationToken::new(),
            output_path,
            reducer_command: sh("exec cat"),
        }
    }

    fn sorted_lines(path: &Path) -> Vec<String> {
        let mut lines = fs::read_to_string(path)
            .expect("artifact should exist")
            .lines()
            .map(str::to_owned)
            .collect::<Vec<_>>();
        lines.sort();
        lines
    }

    #[tokio::test]
    async fn streams_every_record_to_the_reducer() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), "alpha\nalpha\nbeta\n").unwrap();
        fs::write(dir.path().join("b.txt"), "beta\ngamma\n").unwrap();
        let output = dir.path().join("results/job.out");

        let manifest =
            test_manifest(vec![format!("file://{}", dir.path().display())], 5);
        let job = test_job(manifest, output.clone());
        let mut backend = LocalBackend::with_command(sh(CAT_MAPPER), 2);

        let outcome = run_job(&job, &mut backend).await.unwrap();
        assert_eq!(outcome, Outcome::Success);
        assert_eq!(
            sorted_lines(&output),
            vec!["alpha", "alpha", "beta", "beta", "gamma"]
        );

        let snapshot = job.progress.snapshot();
        assert_eq!(snapshot.files_processed, 2);
        assert_eq!(snapshot.files_failed, 0);
        assert_eq!(snapshot.bytes_total, 28);
        assert_eq!(snapshot.bytes_processed, 28);
    }

    #[tokio::test]
    async fn requeues_files_that_fail_transiently() {
        let dir = tempfile::tempdir().unwrap();
        let marks = dir.path().join("marks");
        fs::create_dir(&marks).unwrap();
        for name in ["one", "two", "three"] {
            fs::write(dir.path().join(format!("{}.txt", name)), format!("{}\n", name))
                .unwrap();
        }
        let output = dir.path().join("job.out");

        // Fail the first attempt on every file, succeed on the second.
        let flaky_mapper = format!(
            r#"
while IFS= read -r uri; do
  key=$(printf '%s' "$uri" | tr -c 'a-zA-Z0-9' '_')
  if [ ! -e "{marks}/$key" ]; then
    : > "{marks}/$key"
    printf '!,0,%s\n' "$uri" >&2
  else
    path="${{uri#file://}}"
    cat "$path"
    size=$(wc -c < "$path" | tr -d '[:space:]')
    printf '+,%s,%s\n' "$size" "$uri" >&2
  fi
done
"#,
            marks = marks.display()
        );

        let manifest = test_manifest(
            vec![
                format!("file://{}/one.txt", dir.path().display()),
                format!("file://{}/two.txt", dir.path().display()),
                format!("file://{}/three.txt", dir.path().display()),
            ],
            5,
        );
        let job = test_job(manifest, output.clone());
        let mut backend = LocalBackend::with_command(sh(&flaky_mapper), 2);

        let outcome = run_job(&job, &mut backend).await.unwrap();
        assert_eq!(outcome, Outcome::Success);
        // Each file's records arrive exactly once.
        assert_eq!(sorted_lines(&output), vec!["one", "three", "two"]);

        let snapshot = job.progress.snapshot();
        assert_eq!(snapshot.files_processed, 3);
        assert_eq!(snapshot.files_failed, 0);
        assert!(snapshot
            .messages
            .iter()
            .any(|m| m.contains("requeuing")));
    }

    #[tokio::test]
    async fn gives_up_after_max_retries() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), "unused\n").unwrap();
        let output = dir.path().join("job.out");

        let always_fail = r#"
while IFS= read -r uri; do
  printf '!,0,%s\n' "$uri" >&2
done
"#;
        let manifest =
            test_manifest(vec![format!("file://{}/a.txt", dir.path().display())], 2);
        let job = test_job(manifest, output.clone());
        let mut backend = LocalBackend::with_command(sh(always_fail), 1);

        let outcome = run_job(&job, &mut backend).await.unwrap();
        assert_eq!(outcome, Outcome::Success);
        assert_eq!(fs::read_to_string(&output).unwrap(), "");

        let snapshot = job.progress.snapshot();
        assert_eq!(snapshot.files_processed, 0);
        assert_eq!(snapshot.files_failed, 1);
        assert!(snapshot.messages.iter().any(|m| m.contains("giving up")));
    }

    #[tokio::test]
    async fn mapper_crash_aborts_the_job() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), "unused\n").unwrap();
        let output = dir.path().join("job.out");

        let manifest =
            test_manifest(vec![format!("file://{}/a.txt", dir.path().display())], 5);
        let job = test_job(manifest, output.clone());
        let mut backend = LocalBackend::with_command(sh("exit 3"), 1);

        let outcome = run_job(&job, &mut backend).await.unwrap();
        assert_eq!(outcome, Outcome::WorkerFailed);
        // The artifact still exists, even though it is empty.
        assert!(output.exists());
    }

    #[tokio::test]
    async fn abort_during_streaming_preserves_partial_output() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["a", "b", "c"] {
            fs::write(dir.path().join(format!("{}.txt", name)), "x\n").unwrap();
        }
        let output = dir.path().join("job.out");

        // Process the first file, then stall.
        let slow_mapper = r#"
n=0
while IFS= read -r uri; do
  n=$((n+1))
  printf 'rec-%s\n' "$n"
  printf '+,2,%s\n' "$uri" >&2
  sleep 30 > /dev/null 2>&1
done
"#;
        let manifest =
            test_manifest(vec![format!("file://{}", dir.path().display())], 5);
        let job = test_job(manifest, output.clone());
        let progress = job.progress.clone();
        let abort = job.abort.clone();
        let mut backend = LocalBackend::with_command(sh(slow_mapper), 1);

        let runner =
            tokio::spawn(async move { run_job(&job, &mut backend).await });

        // Wait for the first success, then abort.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while progress.snapshot().files_processed < 1 {
            assert!(
                tokio::time::Instant::now() < deadline,
                "mapper never processed its first file"
            );
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        tokio::time::sleep(Duration::from_millis(300)).await;
        abort.cancel();

        let outcome = runner.await.unwrap().unwrap();
        assert_eq!(outcome, Outcome::UserAborted);
        assert_eq!(fs::read_to_string(&output).unwrap(), "rec-1\n");
    }

    #[tokio::test]
    async fn forwards_a_final_unterminated_record() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), "x\n").unwrap();
        let output = dir.path().join("job.out");

        let unterminated = r#"
IFS= read -r uri
printf 'partial-record'
printf '+,2,%s\n' "$uri" >&2
"#;
        let manifest =
            test_manifest(vec![format!("file://{}/a.txt", dir.path().display())], 5);
        let job = test_job(manifest, output.clone());
        let mut backend = LocalBackend::with_command(sh(unterminated), 1);

        let outcome = run_job(&job, &mut backend).await.unwrap();
        assert_eq!(outcome, Outcome::Success);
        assert_eq!(fs::read_to_string(&output).unwrap(), "partial-record\n");
    }

    #[tokio::test]
    async fn a_mapper_may_emit_no_records_at_all() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), "x\n").unwrap();
        let output = dir.path().join("job.out");

        let silent = r#"
while IFS= read -r uri; do
  printf '+,2,%s\n' "$uri" >&2
done
"#;
        let manifest =
            test_manifest(vec![format!("file://{}/a.txt", dir.path().display())], 5);
        let job = test_job(manifest, output.clone());
        let mut backend = LocalBackend::with_command(sh(silent), 1);

        let outcome = run_job(&job, &mut backend).await.unwrap();
        assert_eq!(outcome, Outcome::Success);
        assert_eq!(fs::read_to_string(&output).unwrap(), "");
        assert_eq!(job.progress.snapshot().files_processed, 1);
    }

    #[tokio::test]
    async fn empty_input_fails_preflight() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = test_manifest(vec![], 5);
        let job = test_job(manifest, dir.path().join("job.out"));
        let mut backend = LocalBackend::with_command(sh(CAT_MAPPER), 1);

        let err = run_job(&job, &mut backend).await.unwrap_err();
        assert_eq!(
            err.downcast_ref::<RunnerError>(),
            Some(&RunnerError::InputMissing)
        );
    }

    #[tokio::test]
    async fn an_empty_listing_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let empty = dir.path().join("empty");
        fs::create_dir(&empty).unwrap();
        let manifest = test_manifest(vec![format!("file://{}", empty.display())], 5);
        let job = test_job(manifest, dir.path().join("job.out"));
        let mut backend = LocalBackend::with_command(sh(CAT_MAPPER), 1);

        let err = run_job(&job, &mut backend).await.unwrap_err();
        assert!(err.to_string().contains("no input files matched"));
    }

    #[tokio::test]
    async fn reducer_death_mid_stream_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), "one\ntwo\n").unwrap();
        let output = dir.path().join("job.out");

        let manifest =
            test_manifest(vec![format!("file://{}/a.txt", dir.path().display())], 5);
        let mut job = test_job(manifest, output.clone());
        // A reducer that dies before reading anything.
        job.reducer_command = sh("exit 7");
        let mut backend = LocalBackend::with_command(sh(CAT_MAPPER), 1);

        let outcome = run_job(&job, &mut backend).await.unwrap();
        assert_eq!(outcome, Outcome::ReducerFailed);
    }
}
