//! Mapper processes on elastic cloud instances.
//!
//! Provisioning injects a fresh per-job ed25519 key pair through a
//! cloud-init payload, so the coordinator can authenticate without any
//! pre-shared credential; the private half never leaves memory. Every
//! provisioned instance is issued a terminate call on every exit path:
//! the caller runs [`MapperBackend::shutdown`] in a scope that covers
//! success, abort, and failure alike.

use std::sync::Arc;

use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_ec2::{
    config::Credentials,
    types::{InstanceStateName, InstanceType},
    Client as Ec2Client,
};
use base64::Engine;
use futures::future::try_join_all;
use kestrel_common::{manifest::JobManifest, prelude::*, POLL_INTERVAL};
use russh::{
    client,
    keys::{Algorithm, PrivateKey, PrivateKeyWithHashAlg},
    ChannelMsg,
};
use tokio::{io::AsyncWriteExt, time::timeout};
use tokio_util::sync::CancellationToken;

use super::{MapperBackend, WorkerHandle};

/// Give up on an instance that has not reached `running` after this
/// many polls.
const INSTANCE_STATE_ATTEMPTS: usize = 150;

/// Give up on an instance that has not accepted a shell connection
/// after this many attempts.
const SSH_CONNECT_ATTEMPTS: usize = 90;

/// Bound on a single shell connection attempt.
const SSH_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Buffer between a channel's demultiplexer and the coordinator's
/// stream readers.
const STREAM_BUFFER: usize = 64 * 1024;

/// Launches mappers over shell channels on freshly provisioned cloud
/// instances.
pub struct Ec2Backend {
    manifest: Arc<JobManifest>,
    manifest_json: Vec<u8>,
    key: Arc<PrivateKey>,
    client: Option<Ec2Client>,
    instance_ids: Vec<String>,
    sessions: Vec<client::Handle<AcceptingClient>>,
}

impl Ec2Backend {
    /// Create a backend for `manifest`, generating the job's key pair.
    pub fn new(manifest: Arc<JobManifest>) -> Result<Ec2Backend> {
        let key = PrivateKey::random(&mut rand::rngs::OsRng, Algorithm::Ed25519)
            .context("could not generate job key pair")?;
        let manifest_json = kestrel_common::serde_json::to_vec_pretty(&*manifest)
            .context("could not serialize job manifest")?;
        Ok(Ec2Backend {
            manifest,
            manifest_json,
            key: Arc::new(key),
            client: None,
            instance_ids: Vec::new(),
            sessions: Vec::new(),
        })
    }

    async fn connect_provider(&self) -> Result<Ec2Client> {
        let cloud = &self.manifest.cloud;
        let region = cloud
            .region
            .clone()
            .ok_or_else(|| format_err!("remote-run requires cloud.region"))?;
        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(region));
        if let (Some(access_key), Some(secret_key)) =
            (&cloud.access_key, &cloud.secret_key)
        {
            loader = loader.credentials_provider(Credentials::new(
                access_key.clone(),
                secret_key.clone(),
                None,
                None,
                "job-manifest",
            ));
        }
        let config = loader.load().await;
        Ok(Ec2Client::new(&config))
    }

    /// Request our fleet and record the instance IDs immediately, so a
    /// failure anywhere later still terminates everything we started.
    #[instrument(skip_all, level = "debug")]
    async fn provision(&mut self, client: &Ec2Client) -> Result<Vec<String>> {
        let cloud = &self.manifest.cloud;
        let image = cloud
            .image
            .clone()
            .ok_or_else(|| format_err!("remote-run requires cloud.image"))?;
        let instance_type = cloud
            .instance_type
            .clone()
            .ok_or_else(|| format_err!("remote-run requires cloud.instance_type"))?;
        if cloud.workers == 0 {
            return Err(format_err!("remote-run requires cloud.workers > 0"));
        }

        let public_key = self
            .key
            .public_key()
            .to_openssh()
            .context("could not encode public key")?;
        let user_data = base64::engine::general_purpose::STANDARD
            .encode(cloud_init_user_data(&public_key));

        let mut request = client
            .run_instances()
            .image_id(image)
            .instance_type(InstanceType::from(instance_type.as_str()))
            .min_count(cloud.workers as i32)
            .max_count(cloud.workers as i32)
            .user_data(user_data);
        for group in &cloud.security_groups {
            request = request.security_groups(group);
        }
        let response = request
            .send()
            .await
            .context("could not start instances")?;

        let instance_ids = response
            .instances()
            .iter()
            .filter_map(|instance| instance.instance_id().map(str::to_owned))
            .collect::<Vec<_>>();
        info!("requested {} instances: {:?}", cloud.workers, instance_ids);
        self.instance_ids = instance_ids.clone();
        Ok(instance_ids)
    }

    /// Wait for an instance to reach `running` and report its address.
    #[instrument(skip_all, fields(instance_id = %instance_id), level = "debug")]
    async fn wait_for_instance(
        client: &Ec2Client,
        instance_id: &str,
        abort: &CancellationToken,
    ) -> Result<String> {
        info!("waiting for instance {} ...", instance_id);
        for _ in 0..INSTANCE_STATE_ATTEMPTS {
            if abort.is_cancelled() {
                return Err(format_err!("aborted while waiting for {}", instance_id));
            }
            let response = client
                .describe_instances()
                .instance_ids(instance_id)
                .send()
                .await
                .with_context(|| format!("could not describe {}", instance_id))?;
            let instance = response
                .reservations()
                .iter()
                .flat_map(|reservation| reservation.instances())
                .find(|instance| instance.instance_id() == Some(instance_id));
            if let Some(instance) = instance {
                let state = instance
                    .state()
                    .and_then(|state| state.name())
                    .cloned();
                match state {
                    Some(InstanceStateName::Running) => {
                        let address = instance
                            .public_ip_address()
                            .or_else(|| instance.private_ip_address())
                            .ok_or_else(|| {
                                format_err!("instance {} has no address", instance_id)
                            })?
                            .to_owned();
                        info!("instance {} started: {}", instance_id, address);
                        return Ok(address);
                    }
                    Some(InstanceStateName::Pending) | None => {}
                    Some(other) => {
                        return Err(format_err!(
                            "invalid state when starting instance {}: {}",
                            instance_id,
                            other.as_str()
                        ))
                        .context(RunnerError::ProvisionFailed {
                            instance_id: instance_id.to_owned(),
                        });
                    }
                }
            }
            sleep_or_abort(abort).await?;
        }
        Err(format_err!(
            "instance {} never reached running",
            instance_id
        ))
        .context(RunnerError::ProvisionFailed {
            instance_id: instance_id.to_owned(),
        })
    }

    /// Repeatedly attempt an authenticated shell connection, with a
    /// bounded per-attempt timeout and a fixed sleep between attempts.
    #[instrument(skip_all, fields(instance_id = %instance_id, address = %address), level = "debug")]
    async fn connect_ssh(
        &self,
        instance_id: &str,
        address: &str,
        abort: &CancellationToken,
    ) -> Result<client::Handle<AcceptingClient>> {
        info!("waiting for ssh on instance {} {} ...", instance_id, address);
        let username = &self.manifest.cloud.ssh_username;
        for _ in 0..SSH_CONNECT_ATTEMPTS {
            if abort.is_cancelled() {
                return Err(format_err!(
                    "aborted while connecting to {}",
                    instance_id
                ));
            }
            match timeout(
                SSH_CONNECT_TIMEOUT,
                self.try_connect(address, username),
            )
            .await
            {
                Ok(Ok(handle)) => return Ok(handle),
                Ok(Err(err)) => debug!("ssh not ready on {}: {}", address, err),
                Err(_elapsed) => debug!("ssh attempt to {} timed out", address),
            }
            sleep_or_abort(abort).await?;
        }
        Err(format_err!("ssh never became ready on {}", address)).context(
            RunnerError::ProvisionFailed {
                instance_id: instance_id.to_owned(),
            },
        )
    }

    async fn try_connect(
        &self,
        address: &str,
        username: &str,
    ) -> Result<client::Handle<AcceptingClient>> {
        let config = Arc::new(client::Config::default());
        let mut handle =
            client::connect(config, (address, 22), AcceptingClient).await?;
        let auth = handle
            .authenticate_publickey(
                username,
                PrivateKeyWithHashAlg::new(self.key.clone(), None),
            )
            .await?;
        if !matches!(auth, client::AuthResult::Success) {
            return Err(format_err!("publickey authentication rejected"));
        }
        Ok(handle)
    }

    /// Run the bootstrap command list, install extra packages, and copy
    /// the manifest to its remote path.
    #[instrument(skip_all, fields(instance_id = %instance_id), level = "debug")]
    async fn initialize_instance(
        &self,
        instance_id: &str,
        session: &client::Handle<AcceptingClient>,
    ) -> Result<()> {
        let cloud = &self.manifest.cloud;
        let mut commands = cloud.initialization_commands.clone();
        for package in &self.manifest.pip_requirements {
            commands.push(format!("sudo pip install {}", package));
        }

        for command in &commands {
            let status = exec_logged(session, command).await?;
            if status != 0 {
                return Err(RunnerError::BootstrapFailed {
                    instance_id: instance_id.to_owned(),
                    command: command.clone(),
                    status,
                }
                .into());
            }
            info!("instance {} successfully ran {}", instance_id, command);
        }

        self.copy_manifest(session).await.with_context(|| {
            format!("could not copy job manifest to {}", instance_id)
        })?;
        info!("instance {} successfully initialized", instance_id);
        Ok(())
    }

    /// Copy the manifest over the existing shell channel.
    async fn copy_manifest(
        &self,
        session: &client::Handle<AcceptingClient>,
    ) -> Result<()> {
        let path = &self.manifest.cloud.remote_config_path;
        let mut channel = session.channel_open_session().await?;
        channel
            .exec(true, format!("cat > {}", shell_quote(path)))
            .await?;
        let mut writer = channel.make_writer();
        writer.write_all(&self.manifest_json).await?;
        // The remote side only sees end-of-stream after an explicit
        // half-close; dropping the writer is not enough.
        writer.shutdown().await?;
        let status = drain_channel(channel).await?;
        if status != 0 {
            return Err(format_err!("cat exited with status {}", status));
        }
        Ok(())
    }

    /// Open one channel per mapper slot and start the mapper on it.
    #[instrument(skip_all, fields(instance_id = %instance_id), level = "debug")]
    async fn launch_mappers(
        &self,
        instance_id: &str,
        session: &client::Handle<AcceptingClient>,
        first_worker_id: usize,
        abort: &CancellationToken,
    ) -> Result<Vec<WorkerHandle>> {
        let command = self.mapper_command();
        let mut handles = Vec::new();
        for slot in 0..self.manifest.workers {
            let worker_id = first_worker_id + slot;
            let mut channel = session.channel_open_session().await.with_context(|| {
                format!("could not open mapper channel on {}", instance_id)
            })?;
            channel.exec(true, command.as_str()).await.with_context(|| {
                format!("could not start mapper on {}", instance_id)
            })?;
            handles.push(demux_channel(worker_id, channel, abort.clone()));
        }
        Ok(handles)
    }

    /// The remote mapper invocation, with credential flags.
    fn mapper_command(&self) -> String {
        let cloud = &self.manifest.cloud;
        let mut command = String::from("kestrel-map");
        if let Some(access_key) = &cloud.access_key {
            command.push_str(" --cloud-access-key ");
            command.push_str(&shell_quote(access_key));
        }
        if let Some(secret_key) = &cloud.secret_key {
            command.push_str(" --cloud-secret-key ");
            command.push_str(&shell_quote(secret_key));
        }
        command.push(' ');
        command.push_str(&shell_quote(&cloud.remote_config_path));
        command
    }
}

#[async_trait]
impl MapperBackend for Ec2Backend {
    async fn start(&mut self, abort: &CancellationToken) -> Result<Vec<WorkerHandle>> {
        let client = self.connect_provider().await?;
        self.client = Some(client.clone());
        let instance_ids = self.provision(&client).await?;

        // One initialization task per instance, joined before any
        // streaming starts.
        let backend: &Ec2Backend = self;
        let initializations =
            instance_ids.iter().enumerate().map(|(index, instance_id)| {
                let client = client.clone();
                let abort = abort.clone();
                async move {
                    let address =
                        Ec2Backend::wait_for_instance(&client, instance_id, &abort)
                            .await?;
                    let session =
                        backend.connect_ssh(instance_id, &address, &abort).await?;
                    backend.initialize_instance(instance_id, &session).await?;
                    let workers = backend
                        .launch_mappers(
                            instance_id,
                            &session,
                            index * backend.manifest.workers,
                            &abort,
                        )
                        .await?;
                    Ok::<_, Error>((session, workers))
                }
            });
        let initialized = try_join_all(initializations).await?;

        let mut handles = Vec::new();
        for (session, workers) in initialized {
            self.sessions.push(session);
            handles.extend(workers);
        }
        Ok(handles)
    }

    /// Terminate every instance we started. Safe to call repeatedly.
    async fn shutdown(&mut self) -> Result<()> {
        self.sessions.clear();
        let instance_ids = std::mem::take(&mut self.instance_ids);
        if instance_ids.is_empty() {
            return Ok(());
        }
        let client = self
            .client
            .as_ref()
            .ok_or_else(|| format_err!("no provider client to terminate with"))?;
        info!("terminating instances: {}", instance_ids.join(","));
        client
            .terminate_instances()
            .set_instance_ids(Some(instance_ids.clone()))
            .send()
            .await
            .with_context(|| {
                format!("could not terminate instances {:?}", instance_ids)
            })?;
        Ok(())
    }
}

/// Accept any host key: instances are created fresh for this job, so
/// there is no prior key to pin.
#[derive(Debug)]
struct AcceptingClient;

impl client::Handler for AcceptingClient {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh::keys::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        Ok(true)
    }
}

/// The cloud-init payload that seeds the job's public key into the
/// default user's authorized keys.
fn cloud_init_user_data(public_key: &str) -> String {
    format!(
        "#cloud-config\nssh_authorized_keys:\n  - {}\n",
        public_key.trim()
    )
}

/// Quote a string for the remote shell.
fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Run a command on a fresh channel, logging its output, and return its
/// exit status.
async fn exec_logged(
    session: &client::Handle<AcceptingClient>,
    command: &str,
) -> Result<i32> {
    let mut channel = session.channel_open_session().await?;
    channel.exec(true, command).await?;

    let mut status = 0;
    while let Some(msg) = channel.wait().await {
        match msg {
            ChannelMsg::Data { data } => {
                for line in String::from_utf8_lossy(&data).lines() {
                    debug!("{}", line);
                }
            }
            ChannelMsg::ExtendedData { data, .. } => {
                for line in String::from_utf8_lossy(&data).lines() {
                    warn!("{}", line);
                }
            }
            ChannelMsg::ExitStatus { exit_status } => status = exit_status as i32,
            _ => {}
        }
    }
    Ok(status)
}

/// Wait for a channel to close, discarding output, and return its exit
/// status.
async fn drain_channel(mut channel: russh::Channel<client::Msg>) -> Result<i32> {
    let mut status = 0;
    while let Some(msg) = channel.wait().await {
        if let ChannelMsg::ExitStatus { exit_status } = msg {
            status = exit_status as i32;
        }
    }
    Ok(status)
}

/// Sleep one poll interval, or fail immediately if abort is set.
async fn sleep_or_abort(abort: &CancellationToken) -> Result<()> {
    tokio::select! {
        _ = tokio::time::sleep(POLL_INTERVAL) => Ok(()),
        _ = abort.cancelled() => Err(format_err!("aborted while waiting")),
    }
}

/// Split a mapper channel into the same stream shape a local child
/// gives us: a writable input, a readable `DATA` stream, a readable
/// `CONTROL` stream, and an exit future.
fn demux_channel(
    worker_id: usize,
    mut channel: russh::Channel<client::Msg>,
    abort: CancellationToken,
) -> WorkerHandle {
    let input = channel.make_writer();
    let (data_read, mut data_write) = tokio::io::simplex(STREAM_BUFFER);
    let (control_read, mut control_write) = tokio::io::simplex(STREAM_BUFFER);

    let exit = tokio::spawn(async move {
        let mut status: Option<i32> = None;
        loop {
            let msg = tokio::select! {
                msg = channel.wait() => msg,
                _ = abort.cancelled() => break,
            };
            match msg {
                Some(ChannelMsg::Data { data }) => {
                    if data_write.write_all(&data).await.is_err() {
                        break;
                    }
                }
                Some(ChannelMsg::ExtendedData { data, .. }) => {
                    if control_write.write_all(&data).await.is_err() {
                        break;
                    }
                }
                Some(ChannelMsg::ExitStatus { exit_status }) => {
                    status = Some(exit_status as i32);
                }
                Some(ChannelMsg::Eof) => {}
                Some(ChannelMsg::Close) | None => break,
                Some(_) => {}
            }
        }
        Ok(status.unwrap_or(-1))
    });

    WorkerHandle {
        worker_id,
        input: Box::new(input),
        data: Box::new(data_read),
        control: Box::new(control_read),
        exit,
        pid: None,
    }
}

#[cfg(test)]
mod tests {
    use kestrel_common::serde_json;

    use super::*;

    fn manifest_with_cloud() -> Arc<JobManifest> {
        Arc::new(
            serde_json::from_str::<JobManifest>(
                r#"{
                    "input": "s3://bucket/data/",
                    "map_command": ["python3", "map.py"],
                    "workers": 2,
                    "cloud": {
                        "access_key": "AKIAEXAMPLE",
                        "secret_key": "secret/with/slashes",
                        "region": "us-east-1",
                        "image": "ami-0abcdef",
                        "instance_type": "m5.large",
                        "workers": 3,
                        "remote_config_path": "/tmp/job config.json"
                    }
                }"#,
            )
            .expect("manifest should parse"),
        )
    }

    #[test]
    fn cloud_init_payload_contains_the_public_key() {
        let payload = cloud_init_user_data("ssh-ed25519 AAAATESTKEY comment\n");
        assert!(payload.starts_with("#cloud-config\n"));
        assert!(payload.contains("ssh_authorized_keys:"));
        assert!(payload.contains("  - ssh-ed25519 AAAATESTKEY comment\n"));
    }

    #[test]
    fn shell_quoting_survives_single_quotes() {
        assert_eq!(shell_quote("plain"), "'plain'");
        assert_eq!(shell_quote("with space"), "'with space'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    #[test]
    fn mapper_command_includes_credentials_and_config() {
        let backend = Ec2Backend::new(manifest_with_cloud()).unwrap();
        let command = backend.mapper_command();
        assert_eq!(
            command,
            "kestrel-map --cloud-access-key 'AKIAEXAMPLE' \
             --cloud-secret-key 'secret/with/slashes' '/tmp/job config.json'"
        );
    }

    #[test]
    fn each_job_generates_a_distinct_key() {
        let a = Ec2Backend::new(manifest_with_cloud()).unwrap();
        let b = Ec2Backend::new(manifest_with_cloud()).unwrap();
        assert_ne!(
            a.key.public_key().to_openssh().unwrap(),
            b.key.public_key().to_openssh().unwrap()
        );
    }
}
