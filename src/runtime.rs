//! Container runtime interface
//!
//! Narrow seam over the container runtime: create/start/stop/remove,
//! label-filtered lifecycle events, address resolution for the proxy, and
//! exec attach/resize for the terminal bridge. `DockerRuntime` is the
//! production implementation on bollard; tests run against `MockRuntime`.

use crate::error::{InstancerError, Result};
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, RemoveContainerOptions,
    StartContainerOptions, StopContainerOptions,
};
use bollard::exec::{CreateExecOptions, ResizeExecOptions, StartExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use bollard::system::EventsOptions;
use bollard::Docker;
use futures::{Stream, StreamExt};
use std::collections::HashMap;
use std::pin::Pin;
use tokio::io::AsyncWrite;
use tracing::{debug, info};

/// Label selecting containers this subsystem manages.
pub const LABEL_MANAGED: &str = "instancer.managed";
/// Registry instance id the container belongs to.
pub const LABEL_INSTANCE: &str = "instancer.instance";
/// Challenge slug used for hostname derivation.
pub const LABEL_CHALLENGE: &str = "instancer.challenge";
/// Opaque challenge id.
pub const LABEL_CHALLENGE_ID: &str = "instancer.challenge_id";
/// Owner (team or user) slug.
pub const LABEL_OWNER: &str = "instancer.owner";
/// Port the challenge service listens on inside the container.
pub const LABEL_PORT: &str = "instancer.port";

/// Runtime lifecycle event, reduced to the actions the watcher dispatches on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventAction {
    Create,
    Start,
    Stop,
    Die,
    Other(String),
}

impl EventAction {
    pub fn parse(action: &str) -> Self {
        match action {
            "create" => EventAction::Create,
            "start" => EventAction::Start,
            "stop" => EventAction::Stop,
            "die" => EventAction::Die,
            other => EventAction::Other(other.to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RuntimeEvent {
    pub action: EventAction,
    pub container_id: String,
    /// Actor attributes: container labels plus runtime extras (image, name).
    pub attributes: HashMap<String, String>,
}

/// Request to create one challenge container.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub env: Vec<String>,
    pub labels: HashMap<String, String>,
    /// e.g. "512m", "2g"
    pub memory_limit: Option<String>,
    /// Fraction of a CPU core, e.g. 0.5.
    pub cpu_limit: Option<f64>,
    pub network_mode: Option<String>,
}

/// One managed container as seen by a reconciliation listing.
#[derive(Debug, Clone)]
pub struct ManagedContainer {
    pub container_id: String,
    pub labels: HashMap<String, String>,
    pub running: bool,
}

/// A live interactive exec inside a container.
pub struct ExecSession {
    pub exec_id: String,
    /// Raw stdout/stderr bytes.
    pub output: Pin<Box<dyn Stream<Item = std::io::Result<Vec<u8>>> + Send>>,
    /// Container stdin.
    pub input: Pin<Box<dyn AsyncWrite + Send>>,
}

pub type EventStream = Pin<Box<dyn Stream<Item = Result<RuntimeEvent>> + Send>>;

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Pull the image if not present locally.
    async fn ensure_image(&self, image: &str) -> Result<()>;

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String>;

    async fn start_container(&self, container_id: &str) -> Result<()>;

    /// Advisory stop; completion is confirmed via the event stream.
    async fn stop_container(&self, container_id: &str) -> Result<()>;

    async fn remove_container(&self, container_id: &str) -> Result<()>;

    /// IP of the container on the runtime network.
    async fn resolve_ip(&self, container_id: &str) -> Result<String>;

    /// All containers carrying the managed label, running or not.
    async fn list_managed(&self) -> Result<Vec<ManagedContainer>>;

    /// Stream of lifecycle events for managed containers only.
    async fn events(&self) -> Result<EventStream>;

    /// Open an interactive TTY exec.
    async fn attach_exec(&self, container_id: &str, cmd: &[String]) -> Result<ExecSession>;

    async fn resize_exec(&self, exec_id: &str, cols: u16, rows: u16) -> Result<()>;
}

fn runtime_err(e: bollard::errors::Error) -> InstancerError {
    InstancerError::RuntimeUnavailable(e.to_string())
}

/// Production runtime backed by the local Docker daemon.
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connect to the local daemon and verify it responds.
    pub async fn connect() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults().map_err(runtime_err)?;
        docker.ping().await.map_err(runtime_err)?;
        info!("Connected to Docker daemon");
        Ok(Self { docker })
    }

    fn managed_filter() -> HashMap<String, Vec<String>> {
        let mut filters = HashMap::new();
        filters.insert(
            "label".to_string(),
            vec![format!("{}=true", LABEL_MANAGED)],
        );
        filters
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn ensure_image(&self, image: &str) -> Result<()> {
        if self.docker.inspect_image(image).await.is_ok() {
            debug!("Image {} already present", image);
            return Ok(());
        }

        info!("Pulling image {}", image);
        let options = CreateImageOptions {
            from_image: image,
            ..Default::default()
        };
        let mut stream = self.docker.create_image(Some(options), None, None);
        while let Some(progress) = stream.next().await {
            let progress = progress.map_err(runtime_err)?;
            if let Some(status) = progress.status {
                debug!("Pull status: {}", status);
            }
        }
        info!("Image {} pulled", image);
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        let memory = spec
            .memory_limit
            .as_deref()
            .map(parse_memory_limit)
            .transpose()?;
        let nano_cpus = spec.cpu_limit.map(|c| (c * 1_000_000_000.0) as i64);

        let config = Config {
            image: Some(spec.image.clone()),
            env: Some(spec.env.clone()),
            labels: Some(spec.labels.clone()),
            host_config: Some(HostConfig {
                memory,
                nano_cpus,
                network_mode: spec.network_mode.clone(),
                auto_remove: Some(false),
                ..Default::default()
            }),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: spec.name.as_str(),
            platform: None,
        };
        let response = self
            .docker
            .create_container(Some(options), config)
            .await
            .map_err(runtime_err)?;
        info!("Created container {} ({})", spec.name, &response.id[..12]);
        Ok(response.id)
    }

    async fn start_container(&self, container_id: &str) -> Result<()> {
        self.docker
            .start_container(container_id, None::<StartContainerOptions<String>>)
            .await
            .map_err(runtime_err)
    }

    async fn stop_container(&self, container_id: &str) -> Result<()> {
        self.docker
            .stop_container(container_id, Some(StopContainerOptions { t: 10 }))
            .await
            .map_err(runtime_err)
    }

    async fn remove_container(&self, container_id: &str) -> Result<()> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        self.docker
            .remove_container(container_id, Some(options))
            .await
            .map_err(runtime_err)
    }

    async fn resolve_ip(&self, container_id: &str) -> Result<String> {
        let inspect = self
            .docker
            .inspect_container(container_id, None)
            .await
            .map_err(runtime_err)?;

        let ip = inspect
            .network_settings
            .and_then(|s| s.networks)
            .and_then(|networks| {
                networks
                    .into_values()
                    .filter_map(|endpoint| endpoint.ip_address)
                    .find(|ip| !ip.is_empty())
            });

        ip.ok_or_else(|| {
            InstancerError::RuntimeUnavailable(format!(
                "container {} has no network address",
                container_id
            ))
        })
    }

    async fn list_managed(&self) -> Result<Vec<ManagedContainer>> {
        let options = ListContainersOptions {
            all: true,
            filters: Self::managed_filter(),
            ..Default::default()
        };
        let containers = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(runtime_err)?;

        Ok(containers
            .into_iter()
            .filter_map(|c| {
                Some(ManagedContainer {
                    container_id: c.id?,
                    labels: c.labels.unwrap_or_default(),
                    running: c.state.as_deref() == Some("running"),
                })
            })
            .collect())
    }

    async fn events(&self) -> Result<EventStream> {
        let mut filters = Self::managed_filter();
        filters.insert("type".to_string(), vec!["container".to_string()]);
        let options = EventsOptions {
            filters,
            ..Default::default()
        };

        let stream = self.docker.events(Some(options)).map(|msg| {
            let msg = msg.map_err(runtime_err)?;
            let actor = msg.actor.unwrap_or_default();
            Ok(RuntimeEvent {
                action: EventAction::parse(msg.action.as_deref().unwrap_or("")),
                container_id: actor.id.unwrap_or_default(),
                attributes: actor.attributes.unwrap_or_default(),
            })
        });
        Ok(Box::pin(stream))
    }

    async fn attach_exec(&self, container_id: &str, cmd: &[String]) -> Result<ExecSession> {
        let exec = self
            .docker
            .create_exec(
                container_id,
                CreateExecOptions {
                    cmd: Some(cmd.to_vec()),
                    attach_stdin: Some(true),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    tty: Some(true),
                    env: Some(vec!["TERM=xterm-256color".to_string()]),
                    ..Default::default()
                },
            )
            .await
            .map_err(runtime_err)?;

        let started = self
            .docker
            .start_exec(&exec.id, Some(StartExecOptions::default()))
            .await
            .map_err(runtime_err)?;

        match started {
            StartExecResults::Attached { output, input } => Ok(ExecSession {
                exec_id: exec.id,
                output: Box::pin(output.map(|chunk| {
                    chunk
                        .map(|log| log.into_bytes().to_vec())
                        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))
                })),
                input,
            }),
            StartExecResults::Detached => Err(InstancerError::RuntimeUnavailable(
                "exec started detached, expected attached stream".to_string(),
            )),
        }
    }

    async fn resize_exec(&self, exec_id: &str, cols: u16, rows: u16) -> Result<()> {
        self.docker
            .resize_exec(
                exec_id,
                ResizeExecOptions {
                    height: rows,
                    width: cols,
                },
            )
            .await
            .map_err(runtime_err)
    }
}

/// Parse a memory limit string ("2g", "512m", "1024k", bytes) to bytes.
pub fn parse_memory_limit(limit: &str) -> Result<i64> {
    let limit = limit.to_lowercase();
    let parse = |num: &str| {
        num.parse::<i64>().map_err(|_| {
            InstancerError::InvalidChallengeSpec(format!("invalid memory limit {:?}", limit))
        })
    };

    if let Some(num) = limit.strip_suffix('g') {
        Ok(parse(num)? * 1024 * 1024 * 1024)
    } else if let Some(num) = limit.strip_suffix('m') {
        Ok(parse(num)? * 1024 * 1024)
    } else if let Some(num) = limit.strip_suffix('k') {
        Ok(parse(num)? * 1024)
    } else {
        parse(&limit)
    }
}

#[cfg(test)]
pub(crate) mod mock {
    //! Scripted runtime for watcher/manager/terminal tests.

    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::Arc;
    use std::task::{Context, Poll};
    use tokio::sync::mpsc;
    use tokio_stream::wrappers::UnboundedReceiverStream;

    #[derive(Debug, Clone, Default)]
    pub struct MockContainer {
        pub labels: HashMap<String, String>,
        pub running: bool,
        pub ip: Option<String>,
    }

    pub struct MockRuntime {
        pub containers: Mutex<HashMap<String, MockContainer>>,
        /// Chronological record of operations, for ordering assertions.
        pub ops: Arc<Mutex<Vec<String>>>,
        pub unavailable: AtomicBool,
        created: AtomicU32,
        events_rx: Mutex<Option<mpsc::UnboundedReceiver<Result<RuntimeEvent>>>>,
        exec_output: Mutex<Option<mpsc::UnboundedReceiver<Vec<u8>>>>,
    }

    impl MockRuntime {
        pub fn new() -> (Arc<Self>, mpsc::UnboundedSender<Result<RuntimeEvent>>) {
            let (tx, rx) = mpsc::unbounded_channel();
            let runtime = Arc::new(Self {
                containers: Mutex::new(HashMap::new()),
                ops: Arc::new(Mutex::new(Vec::new())),
                unavailable: AtomicBool::new(false),
                created: AtomicU32::new(0),
                events_rx: Mutex::new(Some(rx)),
                exec_output: Mutex::new(None),
            });
            (runtime, tx)
        }

        /// Feed the next exec session's output stream from a channel. By
        /// default exec output stays silent (pending).
        pub fn script_exec_output(&self) -> mpsc::UnboundedSender<Vec<u8>> {
            let (tx, rx) = mpsc::unbounded_channel();
            *self.exec_output.lock() = Some(rx);
            tx
        }

        pub fn add_container(&self, id: &str, labels: HashMap<String, String>, running: bool) {
            let mut containers = self.containers.lock();
            let ip = format!("10.0.0.{}", containers.len() + 2);
            containers.insert(
                id.to_string(),
                MockContainer {
                    labels,
                    running,
                    ip: Some(ip),
                },
            );
        }

        pub fn set_ip(&self, id: &str, ip: Option<String>) {
            if let Some(c) = self.containers.lock().get_mut(id) {
                c.ip = ip;
            }
        }

        pub fn created_count(&self) -> u32 {
            self.created.load(Ordering::SeqCst)
        }

        pub fn ops(&self) -> Vec<String> {
            self.ops.lock().clone()
        }

        fn record(&self, op: String) {
            self.ops.lock().push(op);
        }

        fn check_available(&self) -> Result<()> {
            if self.unavailable.load(Ordering::SeqCst) {
                return Err(InstancerError::RuntimeUnavailable("mock down".to_string()));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl ContainerRuntime for MockRuntime {
        async fn ensure_image(&self, image: &str) -> Result<()> {
            self.check_available()?;
            self.record(format!("ensure_image:{}", image));
            Ok(())
        }

        async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
            self.check_available()?;
            let n = self.created.fetch_add(1, Ordering::SeqCst) + 1;
            let id = format!("mock-container-{:08}{:04}", n, n);
            self.containers.lock().insert(
                id.clone(),
                MockContainer {
                    labels: spec.labels.clone(),
                    running: false,
                    ip: Some(format!("10.0.0.{}", n + 1)),
                },
            );
            self.record(format!("create:{}", spec.image));
            Ok(id)
        }

        async fn start_container(&self, container_id: &str) -> Result<()> {
            self.check_available()?;
            if let Some(c) = self.containers.lock().get_mut(container_id) {
                c.running = true;
            }
            self.record(format!("start:{}", container_id));
            Ok(())
        }

        async fn stop_container(&self, container_id: &str) -> Result<()> {
            self.check_available()?;
            if let Some(c) = self.containers.lock().get_mut(container_id) {
                c.running = false;
            }
            self.record(format!("stop:{}", container_id));
            Ok(())
        }

        async fn remove_container(&self, container_id: &str) -> Result<()> {
            self.check_available()?;
            self.containers.lock().remove(container_id);
            self.record(format!("remove:{}", container_id));
            Ok(())
        }

        async fn resolve_ip(&self, container_id: &str) -> Result<String> {
            self.check_available()?;
            self.containers
                .lock()
                .get(container_id)
                .and_then(|c| c.ip.clone())
                .ok_or_else(|| {
                    InstancerError::RuntimeUnavailable(format!(
                        "container {} has no network address",
                        container_id
                    ))
                })
        }

        async fn list_managed(&self) -> Result<Vec<ManagedContainer>> {
            self.check_available()?;
            Ok(self
                .containers
                .lock()
                .iter()
                .filter(|(_, c)| c.labels.get(LABEL_MANAGED).map(String::as_str) == Some("true"))
                .map(|(id, c)| ManagedContainer {
                    container_id: id.clone(),
                    labels: c.labels.clone(),
                    running: c.running,
                })
                .collect())
        }

        async fn events(&self) -> Result<EventStream> {
            self.check_available()?;
            let rx = self
                .events_rx
                .lock()
                .take()
                .ok_or_else(|| InstancerError::RuntimeUnavailable("events taken".to_string()))?;
            Ok(Box::pin(UnboundedReceiverStream::new(rx)))
        }

        async fn attach_exec(&self, container_id: &str, _cmd: &[String]) -> Result<ExecSession> {
            self.check_available()?;
            self.record(format!("attach:{}", container_id));
            let output: Pin<Box<dyn Stream<Item = std::io::Result<Vec<u8>>> + Send>> =
                match self.exec_output.lock().take() {
                    Some(rx) => Box::pin(UnboundedReceiverStream::new(rx).map(Ok)),
                    None => Box::pin(futures::stream::pending()),
                };
            Ok(ExecSession {
                exec_id: format!("exec-{}", container_id),
                output,
                input: Box::pin(RecordingWriter {
                    ops: self.ops.clone(),
                }),
            })
        }

        async fn resize_exec(&self, _exec_id: &str, cols: u16, rows: u16) -> Result<()> {
            self.check_available()?;
            self.record(format!("resize:{}x{}", cols, rows));
            Ok(())
        }
    }

    /// AsyncWrite that records every write into the shared op log.
    pub struct RecordingWriter {
        pub ops: Arc<Mutex<Vec<String>>>,
    }

    impl AsyncWrite for RecordingWriter {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<std::io::Result<usize>> {
            self.ops
                .lock()
                .push(format!("write:{}", String::from_utf8_lossy(buf)));
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
        ) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
        ) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }
}
