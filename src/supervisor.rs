use crate::config::{Config, ServiceSpec};
use crate::error::{describe_exit, SupervisorError};
use crate::launcher;
use crate::probe::{ProbePolicy, ReadinessProbe};
use crate::routing::RouteTable;
use futures::future::try_join_all;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::process::Child;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Lifecycle of one backend process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    /// Spawned, readiness probe not yet passed
    Starting,
    /// Probe passed; traffic may be routed here
    Ready,
    /// Probe exhausted or process exited on its own
    Failed,
    /// Killed by the supervisor
    Terminated,
}

impl ServiceState {
    pub fn can_transition_to(self, next: ServiceState) -> bool {
        use ServiceState::*;
        matches!(
            (self, next),
            (Starting, Ready) | (Starting, Failed) | (Ready, Failed) | (Starting, Terminated) | (Ready, Terminated)
        )
    }

    pub fn is_final(self) -> bool {
        matches!(self, ServiceState::Failed | ServiceState::Terminated)
    }
}

/// A child process that exited without being asked to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceExit {
    pub service: String,
    pub status: String,
}

/// Supervisor-side handle to one launched service
pub struct ManagedService {
    spec: ServiceSpec,
    pid: Option<u32>,
    state: Arc<watch::Sender<ServiceState>>,
    last_exit: Arc<Mutex<Option<String>>>,
    kill_tx: Option<oneshot::Sender<()>>,
    monitor: Option<JoinHandle<()>>,
}

impl ManagedService {
    pub fn spec(&self) -> &ServiceSpec {
        &self.spec
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn state(&self) -> ServiceState {
        *self.state.borrow()
    }

    /// How the process ended, if it ended on its own
    pub fn last_exit(&self) -> Option<String> {
        self.last_exit.lock().clone()
    }
}

/// Apply a state change if the lifecycle allows it
fn transition(state: &watch::Sender<ServiceState>, service: &str, next: ServiceState) -> bool {
    state.send_if_modified(|current| {
        if current.can_transition_to(next) {
            debug!(service, from = ?*current, to = ?next, "Service state change");
            *current = next;
            true
        } else {
            false
        }
    })
}

/// Owns the route table and every child process for the lifetime of the program.
///
/// Construction is cheap and spawns nothing; [`start`](Supervisor::start)
/// launches the services and blocks until all of them answer. The set of
/// services is fixed at construction.
pub struct Supervisor {
    specs: Vec<ServiceSpec>,
    shared_env: HashMap<String, String>,
    routes: Arc<RouteTable>,
    probe: ReadinessProbe,
    services: Vec<ManagedService>,
    exit_tx: mpsc::UnboundedSender<ServiceExit>,
    exit_rx: mpsc::UnboundedReceiver<ServiceExit>,
}

impl Supervisor {
    pub fn new(
        specs: Vec<ServiceSpec>,
        shared_env: HashMap<String, String>,
        policy: ProbePolicy,
    ) -> anyhow::Result<Self> {
        let routes = RouteTable::from_services(&specs)
            .ok_or_else(|| anyhow::anyhow!("No fallback service configured"))?;
        let (exit_tx, exit_rx) = mpsc::unbounded_channel();

        Ok(Self {
            specs,
            shared_env,
            routes: Arc::new(routes),
            probe: ReadinessProbe::new(policy),
            services: Vec::new(),
            exit_tx,
            exit_rx,
        })
    }

    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        Self::new(
            config.services.clone(),
            config.env.clone(),
            ProbePolicy::from(&config.probe),
        )
    }

    /// Shared read-only routing table
    pub fn routes(&self) -> Arc<RouteTable> {
        Arc::clone(&self.routes)
    }

    pub fn services(&self) -> &[ManagedService] {
        &self.services
    }

    /// Launch every service and wait until all of them answer.
    ///
    /// All-or-nothing: on any failure every launched child is killed before
    /// the error is returned.
    pub async fn start(&mut self) -> Result<(), SupervisorError> {
        let started = Instant::now();

        if let Err(e) = self.launch_all() {
            error!(error = %e, "Service launch failed, aborting startup");
            self.shutdown().await;
            return Err(e);
        }

        let probes = self.services.iter().map(|service| {
            wait_service_ready(
                self.probe.clone(),
                service.spec.clone(),
                Arc::clone(&service.state),
                Arc::clone(&service.last_exit),
            )
        });
        let result = try_join_all(probes).await;

        match result {
            Ok(_) => {
                info!(
                    services = self.services.len(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "All services ready"
                );
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "Startup failed, terminating all services");
                self.shutdown().await;
                Err(e)
            }
        }
    }

    fn launch_all(&mut self) -> Result<(), SupervisorError> {
        for spec in &self.specs {
            let child = launcher::launch(spec, &self.shared_env)?;
            let service = self.monitor(spec.clone(), child);
            self.services.push(service);
        }
        Ok(())
    }

    /// Hand the child to a task that reports its exit or kills it on request
    fn monitor(&self, spec: ServiceSpec, mut child: Child) -> ManagedService {
        let pid = child.id();
        let (state_tx, _) = watch::channel(ServiceState::Starting);
        let state = Arc::new(state_tx);
        let (kill_tx, kill_rx) = oneshot::channel::<()>();

        let last_exit = Arc::new(Mutex::new(None));

        let task_state = Arc::clone(&state);
        let task_last_exit = Arc::clone(&last_exit);
        let exit_tx = self.exit_tx.clone();
        let name = spec.name.clone();

        let monitor = tokio::spawn(async move {
            tokio::select! {
                status = child.wait() => {
                    let status = describe_exit(&status);
                    *task_last_exit.lock() = Some(status.clone());
                    if transition(&task_state, &name, ServiceState::Failed) {
                        error!(service = %name, %status, "Service exited unexpectedly");
                        let _ = exit_tx.send(ServiceExit { service: name, status });
                    }
                }
                _ = kill_rx => {
                    kill_child(&name, &mut child);
                    if let Err(e) = child.wait().await {
                        warn!(service = %name, error = %e, "Failed to reap service process");
                    }
                    transition(&task_state, &name, ServiceState::Terminated);
                }
            }
        });

        ManagedService {
            spec,
            pid,
            state,
            last_exit,
            kill_tx: Some(kill_tx),
            monitor: Some(monitor),
        }
    }

    /// Ask every monitor to kill its child. Does not wait for the exits.
    pub fn kill_all(&mut self) {
        for service in &mut self.services {
            if let Some(kill_tx) = service.kill_tx.take() {
                if kill_tx.send(()).is_err() {
                    debug!(service = %service.spec.name, "Service already exited");
                }
            }
        }
    }

    /// Kill everything and wait until each child has been reaped
    pub async fn shutdown(&mut self) {
        self.kill_all();
        for service in &mut self.services {
            if let Some(monitor) = service.monitor.take() {
                if let Err(e) = monitor.await {
                    warn!(service = %service.spec.name, error = %e, "Service monitor task failed");
                }
            }
            if let Some(status) = service.last_exit() {
                debug!(service = %service.spec.name, %status, "Service had already exited");
            }
        }
        info!(services = self.services.len(), "All services signalled");
    }

    /// Resolves when a service exits without a kill request
    pub async fn wait_for_exit(&mut self) -> Option<ServiceExit> {
        self.exit_rx.recv().await
    }
}

/// Probe one service, giving up early if its process dies first
async fn wait_service_ready(
    probe: ReadinessProbe,
    spec: ServiceSpec,
    state: Arc<watch::Sender<ServiceState>>,
    last_exit: Arc<Mutex<Option<String>>>,
) -> Result<(), SupervisorError> {
    let mut state_rx = state.subscribe();

    let exited = async {
        let _ = state_rx.wait_for(|s| s.is_final()).await;
    };

    tokio::select! {
        result = probe.wait_ready(spec.port) => match result {
            Ok(attempts) => {
                transition(&state, &spec.name, ServiceState::Ready);
                info!(service = %spec.name, port = spec.port, attempts, "Service is ready");
                Ok(())
            }
            Err(exhausted) => {
                transition(&state, &spec.name, ServiceState::Failed);
                error!(
                    service = %spec.name,
                    port = spec.port,
                    attempts = exhausted.attempts,
                    "Service never became ready"
                );
                Err(SupervisorError::ProbeExhausted {
                    service: spec.name.clone(),
                    port: spec.port,
                    attempts: exhausted.attempts,
                })
            }
        },
        _ = exited => {
            let status = last_exit
                .lock()
                .clone()
                .unwrap_or_else(|| "terminated".to_string());
            error!(service = %spec.name, %status, "Service exited before becoming ready");
            Err(SupervisorError::ExitedDuringStartup {
                service: spec.name.clone(),
                status,
            })
        }
    }
}

/// SIGKILL the child's whole process group, falling back to the child alone
fn kill_child(service: &str, child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        info!(service, pid, "Sending SIGKILL to service process group");
        let result = unsafe { libc::kill(-(pid as i32), libc::SIGKILL) };
        if result == 0 {
            return;
        }
        debug!(service, pid, error = %std::io::Error::last_os_error(), "Group kill failed");
    }

    if let Err(e) = child.start_kill() {
        warn!(service, error = %e, "Failed to kill service process");
    }
}
