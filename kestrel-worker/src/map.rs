#![deny(unsafe_code)]

//! `kestrel-map`: the mapper worker.
//!
//! Reads input URIs from stdin, one per line, until end-of-stream. Each
//! file is downloaded to a fresh temporary path and handed to the user
//! map command; the command's stdout lines become `DATA` records on our
//! stdout, and a `status,size,uri` line on our stderr (`CONTROL`)
//! reports the outcome. Per-file failures are reported and skipped;
//! only broken worker plumbing is fatal.

use std::{env, process::Stdio};

use kestrel_common::{
    control::ControlRecord,
    manifest::JobManifest,
    prelude::*,
    storage::CloudStorage,
    tracing_support::initialize_worker_tracing,
};
use tokio::{
    io::{self, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader},
    process::Command,
    signal::unix::{signal, SignalKind},
};

/// Instructions on how to use this program.
const USAGE: &str =
    "Usage: kestrel-map [--cloud-access-key KEY] [--cloud-secret-key SECRET] <config>";

/// Our main entry point.
#[tokio::main]
async fn main() -> Result<()> {
    initialize_worker_tracing();

    // Parse our arguments (manually, so we don't need to drag in a ton
    // of libraries).
    let mut config_path = None;
    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--version" => {
                println!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--help" => {
                println!("{}", USAGE);
                std::process::exit(0);
            }
            "--cloud-access-key" => {
                let key = args.next().unwrap_or_default();
                env::set_var("AWS_ACCESS_KEY_ID", key);
            }
            "--cloud-secret-key" => {
                let secret = args.next().unwrap_or_default();
                env::set_var("AWS_SECRET_ACCESS_KEY", secret);
            }
            _ if config_path.is_none() => config_path = Some(PathBuf::from(arg)),
            _ => {
                eprintln!("{}", USAGE);
                std::process::exit(1);
            }
        }
    }
    let config_path = match config_path {
        Some(path) => path,
        None => {
            eprintln!("{}", USAGE);
            std::process::exit(1);
        }
    };
    let manifest = JobManifest::load(&config_path)?;

    let mut uris = BufReader::new(io::stdin()).lines();
    let mut data = io::stdout();
    let mut control = io::stderr();
    let mut terminate = signal(SignalKind::terminate())
        .context("could not install signal handler")?;

    debug!("mapper starting to read stdin");
    loop {
        tokio::select! {
            line = uris.next_line() => {
                let uri = match line.context("error reading mapper input")? {
                    Some(line) => line.trim().to_owned(),
                    None => break,
                };
                if uri.is_empty() {
                    continue;
                }
                debug!("mapper got {}", uri);
                let record = match map_one(&manifest, &uri, &mut data).await {
                    Ok(size) => ControlRecord::processed(size, &uri),
                    Err(err) => {
                        warn!("failed to process {}: {:?}", uri, err);
                        ControlRecord::failed(&uri)
                    }
                };
                // Flush DATA before reporting, so records from distinct
                // files never share a partial line and the coordinator
                // never sees a `+` before the file's records.
                data.flush().await.context("error flushing data stream")?;
                control
                    .write_all(format!("{}\n", record).as_bytes())
                    .await
                    .context("error writing control record")?;
                control.flush().await.context("error flushing control stream")?;
            }
            _ = tokio::signal::ctrl_c() => {
                return abort_for_signal(&mut control).await;
            }
            _ = terminate.recv() => {
                return abort_for_signal(&mut control).await;
            }
        }
    }
    Ok(())
}

/// Report an aborting signal on `CONTROL` and exit nonzero.
async fn abort_for_signal(control: &mut (impl AsyncWrite + Unpin)) -> Result<()> {
    error!("map worker {} aborted", std::process::id());
    let _ = control
        .write_all(format!("map worker {} aborted\n", std::process::id()).as_bytes())
        .await;
    let _ = control.flush().await;
    std::process::exit(1);
}

/// Download one URI and run the user map command on it, appending the
/// command's stdout to `data`. Returns the byte size of the downloaded
/// file.
///
/// Any error here is a per-file failure: the caller reports `!` on
/// `CONTROL` and moves on to the next URI.
#[instrument(skip_all, fields(uri = %uri), level = "debug")]
async fn map_one(
    manifest: &JobManifest,
    uri: &str,
    data: &mut (impl AsyncWrite + Unpin),
) -> Result<u64> {
    let temp = tempfile::Builder::new()
        .prefix("kestrel-input-")
        .tempfile()
        .context("could not create temporary file")?;
    let local_path = temp.path().to_owned();

    let storage = <dyn CloudStorage>::for_uri(uri).await?;
    storage
        .download(uri, &local_path)
        .await
        .with_context(|| format!("could not download {}", uri))?;
    let size = tokio::fs::metadata(&local_path)
        .await
        .context("could not stat downloaded file")?
        .len();

    run_map_command(&manifest.map_command, &local_path, uri, data).await?;

    // The temporary file is deleted when `temp` drops, success or not.
    drop(temp);
    Ok(size)
}

/// Run the user map command with the downloaded path and the original
/// URI as its final arguments, copying its stdout into `data`.
async fn run_map_command(
    argv: &[String],
    local_path: &Path,
    uri: &str,
    data: &mut (impl AsyncWrite + Unpin),
) -> Result<()> {
    let mut child = Command::new(&argv[0])
        .args(&argv[1..])
        .arg(local_path)
        .arg(uri)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("could not run {:?}", argv[0]))?;

    let stdout = child
        .stdout
        .take()
        .expect("child should always have a stdout");
    let stderr = child
        .stderr
        .take()
        .expect("child should always have a stderr");

    // Drain both streams concurrently so neither pipe can fill up and
    // stall the command.
    let (copied, ()) = tokio::join!(
        async {
            let mut stdout = stdout;
            tokio::io::copy(&mut stdout, data).await
        },
        log_command_stderr(stderr),
    );
    copied.context("error reading map command output")?;

    let status = child
        .wait()
        .await
        .with_context(|| format!("error running {:?}", argv[0]))?;
    if !status.success() {
        return Err(format_err!(
            "map command {:?} failed with status {}",
            argv,
            status
        ));
    }
    Ok(())
}

/// The map command's stderr is not part of the wire protocol; log it.
async fn log_command_stderr(stderr: impl AsyncRead + Unpin) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        warn!("map command: {}", line);
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    fn manifest_with_map_command(argv: Vec<&str>) -> JobManifest {
        let mut manifest: JobManifest = kestrel_common::serde_json::from_str(
            r#"{"input": "file:///unused", "map_command": ["true"]}"#,
        )
        .unwrap();
        manifest.map_command = argv.into_iter().map(str::to_owned).collect();
        manifest
    }

    #[tokio::test]
    async fn maps_one_file_and_reports_its_size() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in.txt");
        fs::write(&input, "alpha\nbeta\n").unwrap();

        // `$1` is the downloaded path; emit one record per line.
        let manifest =
            manifest_with_map_command(vec!["/bin/sh", "-c", r#"cat "$1""#, "map"]);
        let mut data = Vec::new();
        let size = map_one(
            &manifest,
            &format!("file://{}", input.display()),
            &mut data,
        )
        .await
        .unwrap();

        assert_eq!(size, 11);
        assert_eq!(data, b"alpha\nbeta\n");
    }

    #[tokio::test]
    async fn map_command_receives_the_uri_too() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in.txt");
        fs::write(&input, "x").unwrap();

        let manifest = manifest_with_map_command(vec![
            "/bin/sh",
            "-c",
            r#"printf '%s\n' "$2""#,
            "map",
        ]);
        let uri = format!("file://{}", input.display());
        let mut data = Vec::new();
        map_one(&manifest, &uri, &mut data).await.unwrap();
        assert_eq!(String::from_utf8(data).unwrap().trim(), uri);
    }

    #[tokio::test]
    async fn failing_map_command_is_a_per_file_error() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in.txt");
        fs::write(&input, "x").unwrap();

        let manifest = manifest_with_map_command(vec!["/bin/sh", "-c", "exit 3"]);
        let mut data = Vec::new();
        let result = map_one(
            &manifest,
            &format!("file://{}", input.display()),
            &mut data,
        )
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn missing_input_is_a_per_file_error() {
        let manifest = manifest_with_map_command(vec!["/bin/true"]);
        let mut data = Vec::new();
        let result = map_one(&manifest, "file:///no/such/file", &mut data).await;
        assert!(result.is_err());
    }
}
