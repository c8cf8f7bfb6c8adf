//! Lifecycle of the single backend process
//!
//! The [`Supervisor`] owns at most one [`BackendProcess`] at a time (a
//! single slot, never a collection). It spawns the backend on demand, polls
//! it until it answers, attaches the event-socket upstream, and tears
//! everything down on idle expiry, reload, crash or explicit stop.
//!
//! Every asynchronous event (process exit, boot completion, idle expiry,
//! upstream loss) carries the generation of the activation that produced it.
//! Events from an older generation are ignored, so a late exit notification
//! can never tear down a newer backend.

use crate::broadcast::{Broadcaster, UpstreamLink};
use crate::config::BackendConfig;
use crate::error::SupervisorError;
use crate::health::{self, PollError};
use crate::idle::IdleTimer;
use crate::pool::ConnectionPool;
use crate::startup::{Outcome, StartupSession};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// State of the backend as seen by request handling
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendState {
    /// No process; the next request starts one
    Stopped,
    /// Process spawned, waiting for it to answer
    Starting,
    /// Process answering and event socket attached
    Ready,
    /// Too many consecutive boot failures; spawning is refused for a while
    Failed,
}

/// What to run
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub working_dir: Option<PathBuf>,
    pub port: u16,
}

impl From<&BackendConfig> for LaunchSpec {
    fn from(config: &BackendConfig) -> Self {
        Self {
            program: config.command.clone(),
            args: config.args.clone(),
            env: config.env.clone(),
            working_dir: config.working_dir.clone(),
            port: config.port,
        }
    }
}

impl LaunchSpec {
    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        if let Some(ref dir) = self.working_dir {
            cmd.current_dir(dir);
        }

        cmd.envs(&self.env);
        cmd.env("PORT", self.port.to_string());
        cmd
    }
}

/// Result of [`Supervisor::start`]
#[derive(Debug, Clone)]
pub struct Activation {
    /// Identifies this activation cycle
    pub generation: u64,
    /// Progress log for the boot
    pub session: StartupSession,
    /// False when an existing activation was joined
    pub spawned: bool,
}

impl Activation {
    /// Wait for the boot to finish
    pub async fn outcome(&self) -> Outcome {
        let mut reader = self.session.subscribe();
        while reader.next_chunk().await.is_some() {}
        self.session.outcome().unwrap_or(Outcome::Stopped)
    }
}

/// The live backend. Only ever held in the supervisor's slot.
struct BackendProcess {
    generation: u64,
    pid: Option<u32>,
    state: BackendState,
    session: StartupSession,
    /// Dropping or firing this makes the monitor terminate the child
    stop_tx: Option<oneshot::Sender<()>>,
    exit_rx: watch::Receiver<Option<String>>,
}

#[derive(Default)]
struct Slot {
    backend: Option<BackendProcess>,
    next_generation: u64,
    consecutive_failures: u32,
    last_failure: Option<Instant>,
}

/// Owns the backend process, its event-socket fan-out and its idle timer.
///
/// `Supervisor` is shared behind an `Arc`; [`new`](Supervisor::new) returns
/// `Arc<Self>` directly because starting a backend spawns tasks that keep a
/// handle to it.
pub struct Supervisor {
    config: BackendConfig,
    launch: LaunchSpec,
    slot: Mutex<Slot>,
    broadcaster: Arc<Broadcaster>,
    idle: IdleTimer,
    pool: Arc<ConnectionPool>,
    spawns: AtomicU64,
}

impl Supervisor {
    pub fn new(config: BackendConfig, pool: Arc<ConnectionPool>) -> Arc<Self> {
        Arc::new(Self {
            launch: LaunchSpec::from(&config),
            config,
            slot: Mutex::new(Slot::default()),
            broadcaster: Broadcaster::new(),
            idle: IdleTimer::new(),
            pool,
            spawns: AtomicU64::new(0),
        })
    }

    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    pub fn broadcaster(&self) -> &Arc<Broadcaster> {
        &self.broadcaster
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    /// Current state of the backend
    pub fn state(&self) -> BackendState {
        let slot = self.slot.lock();
        match slot.backend {
            Some(ref backend) => backend.state,
            None if self.circuit_retry_in(&slot).is_some() => BackendState::Failed,
            None => BackendState::Stopped,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.state() == BackendState::Ready
    }

    /// PID of the running backend
    pub fn pid(&self) -> Option<u32> {
        self.slot.lock().backend.as_ref().and_then(|b| b.pid)
    }

    /// Generation of the current activation
    pub fn generation(&self) -> Option<u64> {
        self.slot.lock().backend.as_ref().map(|b| b.generation)
    }

    /// The boot progress log, while starting
    pub fn session(&self) -> Option<StartupSession> {
        self.slot
            .lock()
            .backend
            .as_ref()
            .filter(|b| b.state == BackendState::Starting)
            .map(|b| b.session.clone())
    }

    /// Total processes spawned since creation
    pub fn spawn_count(&self) -> u64 {
        self.spawns.load(Ordering::SeqCst)
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.slot.lock().consecutive_failures
    }

    /// When the idle teardown is due
    pub fn idle_deadline(&self) -> Option<Instant> {
        self.idle.deadline()
    }

    fn circuit_retry_in(&self, slot: &Slot) -> Option<Duration> {
        let threshold = self.config.retry.max_boot_failures;
        if threshold == 0 || slot.consecutive_failures < threshold {
            return None;
        }
        let cooldown = self.config.retry.boot_failure_cooldown();
        let elapsed = slot.last_failure?.elapsed();
        (elapsed < cooldown).then(|| cooldown - elapsed)
    }

    /// Start the backend, or join the activation already in progress.
    ///
    /// Concurrent callers never cause a second spawn: the slot is checked and
    /// filled under one lock.
    pub fn start(self: &Arc<Self>) -> Result<Activation, SupervisorError> {
        let mut slot = self.slot.lock();

        if let Some(ref backend) = slot.backend {
            debug!(generation = backend.generation, state = ?backend.state, "Backend already running or starting");
            return Ok(Activation {
                generation: backend.generation,
                session: backend.session.clone(),
                spawned: false,
            });
        }

        if let Some(retry_in) = self.circuit_retry_in(&slot) {
            return Err(SupervisorError::CircuitOpen {
                failures: slot.consecutive_failures,
                retry_in,
            });
        }

        slot.next_generation += 1;
        let generation = slot.next_generation;
        let session = StartupSession::new();

        info!(
            generation,
            command = %self.launch.program,
            port = self.launch.port,
            "Starting backend"
        );
        session.append_line(&format!(
            "Starting {} (port {})",
            self.launch.program, self.launch.port
        ));

        let mut child = match self.launch.command().spawn() {
            Ok(child) => child,
            Err(source) => {
                slot.consecutive_failures += 1;
                slot.last_failure = Some(Instant::now());
                error!(generation, command = %self.launch.program, error = %source, "Failed to spawn backend");
                return Err(SupervisorError::SpawnFailure {
                    command: self.launch.program.clone(),
                    source,
                });
            }
        };

        let pid = child.id();
        self.spawns.fetch_add(1, Ordering::SeqCst);
        info!(generation, pid, "Backend process spawned");

        let show_output = self.config.show_output;
        if let Some(stdout) = child.stdout.take() {
            pump_output(stdout, "stdout", pid, session.clone(), show_output);
        }
        if let Some(stderr) = child.stderr.take() {
            pump_output(stderr, "stderr", pid, session.clone(), show_output);
        }

        let (stop_tx, stop_rx) = oneshot::channel();
        let (exit_tx, exit_rx) = watch::channel(None);

        slot.backend = Some(BackendProcess {
            generation,
            pid,
            state: BackendState::Starting,
            session: session.clone(),
            stop_tx: Some(stop_tx),
            exit_rx: exit_rx.clone(),
        });
        drop(slot);

        tokio::spawn(Arc::clone(self).monitor(generation, child, stop_rx, exit_tx));

        let supervisor = Arc::clone(self);
        let boot_session = session.clone();
        tokio::spawn(async move {
            match supervisor.boot(&boot_session, exit_rx).await {
                Ok(link) => {
                    supervisor.mark_ready(generation, link);
                }
                Err(e) => supervisor.fail_boot(generation, e),
            }
        });

        Ok(Activation {
            generation,
            session,
            spawned: true,
        })
    }

    /// Poll until the backend answers, then open the event socket.
    ///
    /// Fails as soon as the process exits instead of polling a dead port.
    async fn boot(
        &self,
        session: &StartupSession,
        mut exit_rx: watch::Receiver<Option<String>>,
    ) -> Result<UpstreamLink, SupervisorError> {
        let policy = self.config.retry.policy();
        let probe_timeout = self.config.retry.probe_timeout();
        let authority = self.config.authority();
        let health_path = self.config.health_path.as_str();
        let pool = self.pool.as_ref();
        let started = Instant::now();

        session.append_line(&format!("Waiting for {} to accept connections", authority));

        let exited = exit_rx.clone();
        let probing = health::poll(
            &policy,
            || {
                session.append_chunk(".");
                health::probe(pool, &authority, health_path, probe_timeout)
            },
            || exited.borrow().is_some(),
        );

        let polled = tokio::select! {
            result = probing => result,
            status = wait_for_exit(&mut exit_rx) => {
                return Err(SupervisorError::ProcessExitedDuringBoot { status });
            }
        };
        session.append_line("");

        match polled {
            Ok(attempts) => {
                debug!(attempts, elapsed_ms = started.elapsed().as_millis() as u64, "Backend answered");
            }
            Err(PollError::Fatal { .. }) => {
                return Err(SupervisorError::ProcessExitedDuringBoot {
                    status: exit_status(&exit_rx),
                });
            }
            Err(PollError::DeadlineExceeded { attempts, elapsed }) => {
                return Err(SupervisorError::HealthCheckTimeout { attempts, elapsed });
            }
        }

        let url = self.config.socket_url();
        session.append_line(&format!("Connecting to {}", url));

        let link = Mutex::new(None);
        let link_slot = &link;
        let url_ref = url.as_str();
        let connecting = health::poll(
            &policy,
            move || async move {
                match UpstreamLink::connect(url_ref).await {
                    Ok(l) => {
                        *link_slot.lock() = Some(l);
                        true
                    }
                    Err(e) => {
                        debug!(error = %e, "Event socket not ready");
                        false
                    }
                }
            },
            || exited.borrow().is_some(),
        );

        let connected = tokio::select! {
            result = connecting => result,
            status = wait_for_exit(&mut exit_rx) => {
                return Err(SupervisorError::ProcessExitedDuringBoot { status });
            }
        };

        match connected {
            Ok(_) => link.into_inner().ok_or_else(|| {
                SupervisorError::UpstreamUnavailable(format!("{}: no connection", url))
            }),
            Err(PollError::Fatal { .. }) => Err(SupervisorError::ProcessExitedDuringBoot {
                status: exit_status(&exit_rx),
            }),
            Err(PollError::DeadlineExceeded { attempts, elapsed }) => {
                Err(SupervisorError::HealthCheckTimeout { attempts, elapsed })
            }
        }
    }

    /// Wait until activation `generation` is ready
    pub async fn await_ready(&self, generation: u64) -> Result<(), SupervisorError> {
        let session = {
            let slot = self.slot.lock();
            match slot.backend.as_ref().filter(|b| b.generation == generation) {
                Some(backend) if backend.state == BackendState::Ready => return Ok(()),
                Some(backend) => backend.session.clone(),
                None => {
                    return Err(SupervisorError::UpstreamUnavailable(format!(
                        "activation {} is no longer current",
                        generation
                    )))
                }
            }
        };

        let mut reader = session.subscribe();
        while reader.next_chunk().await.is_some() {}

        match session.outcome() {
            Some(Outcome::Ready) => Ok(()),
            Some(Outcome::Failed(message)) => Err(SupervisorError::BootFailed(message)),
            _ => Err(SupervisorError::UpstreamUnavailable(
                "backend stopped before becoming ready".to_string(),
            )),
        }
    }

    /// Flip a starting backend to ready and attach its upstream link
    fn mark_ready(self: &Arc<Self>, generation: u64, link: UpstreamLink) -> bool {
        let mut slot = self.slot.lock();
        let session = match slot.backend.as_mut() {
            Some(backend)
                if backend.generation == generation && backend.state == BackendState::Starting =>
            {
                backend.state = BackendState::Ready;
                backend.session.clone()
            }
            _ => {
                debug!(generation, "Ignoring readiness of a stale activation");
                return false;
            }
        };

        slot.consecutive_failures = 0;
        slot.last_failure = None;
        self.broadcaster.attach_upstream(link);
        self.schedule_idle(generation);

        session.append_line("Backend is ready");
        session.close(Outcome::Ready);
        drop(slot);

        info!(generation, "Backend is now ready");
        self.watch_upstream(generation);
        true
    }

    fn fail_boot(&self, generation: u64, err: SupervisorError) {
        let mut slot = self.slot.lock();
        let current = slot
            .backend
            .as_ref()
            .is_some_and(|b| b.generation == generation && b.state == BackendState::Starting);
        if !current {
            debug!(generation, error = %err, "Ignoring boot failure of a stale activation");
            return;
        }

        slot.consecutive_failures += 1;
        slot.last_failure = Some(Instant::now());
        let failures = slot.consecutive_failures;

        if let Some(ref backend) = slot.backend {
            backend.session.append_line(&format!("Error: {}", err));
            backend.session.close(Outcome::Failed(err.to_string()));
        }
        self.teardown_locked(&mut slot);
        drop(slot);

        error!(generation, failures, error = %err, "Backend failed to start");
    }

    /// Reset the idle deadline. No-op unless the backend is ready.
    pub fn touch(self: &Arc<Self>) {
        let slot = self.slot.lock();
        if let Some(backend) = slot.backend.as_ref().filter(|b| b.state == BackendState::Ready) {
            self.schedule_idle(backend.generation);
        }
    }

    fn schedule_idle(self: &Arc<Self>, generation: u64) {
        let supervisor = Arc::downgrade(self);
        self.idle.reset(self.config.idle_timeout(), async move {
            if let Some(supervisor) = supervisor.upgrade() {
                supervisor.expire_idle(generation);
            }
        });
    }

    fn expire_idle(&self, generation: u64) {
        let mut slot = self.slot.lock();
        // `touch` reschedules under the slot lock, so a deadline installed
        // after this one fired is visible here.
        if self.idle.is_scheduled() {
            debug!(generation, "Idle expiry superseded by later activity");
            return;
        }
        let current = slot
            .backend
            .as_ref()
            .is_some_and(|b| b.generation == generation && b.state == BackendState::Ready);
        if !current {
            return;
        }
        self.teardown_locked(&mut slot);
        drop(slot);

        info!(
            generation,
            idle_secs = self.config.idle_timeout_secs,
            "Backend idle timeout reached"
        );
    }

    fn watch_upstream(self: &Arc<Self>, generation: u64) {
        let mut connected = self.broadcaster.subscribe_connected();
        let supervisor = Arc::downgrade(self);
        tokio::spawn(async move {
            if connected.wait_for(|c| !*c).await.is_err() {
                return;
            }
            if let Some(supervisor) = supervisor.upgrade() {
                if supervisor.stop_if(generation, BackendState::Ready, "event socket lost") {
                    let err = SupervisorError::UpstreamUnavailable("event socket closed".to_string());
                    warn!(generation, error = %err, "Stopping backend");
                }
            }
        });
    }

    /// Tear down live activation `generation`, e.g. after it asked for a
    /// reload or stopped answering. Stale generations are ignored.
    pub fn invalidate(&self, generation: u64, reason: &str) -> bool {
        let stopped = self.stop_if(generation, BackendState::Ready, reason);
        if stopped {
            info!(generation, reason, "Backend invalidated");
        }
        stopped
    }

    /// Tear down when `generation` is current and in `state`. True if it was.
    fn stop_if(&self, generation: u64, state: BackendState, reason: &str) -> bool {
        let mut slot = self.slot.lock();
        let matches = slot
            .backend
            .as_ref()
            .is_some_and(|b| b.generation == generation && b.state == state);
        if matches {
            debug!(generation, reason, "Tearing down backend");
            self.teardown_locked(&mut slot);
        }
        matches
    }

    /// Empty the slot, detach all sockets and cancel the idle deadline.
    ///
    /// Runs under the slot lock so no request can observe a ready state
    /// without an upstream, or register a socket against a dying backend.
    fn teardown_locked(&self, slot: &mut Slot) -> Option<watch::Receiver<Option<String>>> {
        self.broadcaster.detach_all();
        self.idle.cancel();

        let mut backend = slot.backend.take()?;
        backend.session.close(Outcome::Stopped);
        if let Some(stop_tx) = backend.stop_tx.take() {
            // Err means the monitor already saw the exit
            let _ = stop_tx.send(());
        }
        Some(backend.exit_rx)
    }

    /// Stop the backend and wait for the process to go away.
    ///
    /// Safe to call when nothing is running.
    pub async fn stop(&self) {
        let exit_rx = {
            let mut slot = self.slot.lock();
            let generation = slot.backend.as_ref().map(|b| b.generation);
            if let Some(generation) = generation {
                info!(generation, "Stopping backend");
            }
            self.teardown_locked(&mut slot)
        };

        if let Some(mut exit_rx) = exit_rx {
            let wait = self.config.shutdown_grace_period() + Duration::from_secs(1);
            let exited = tokio::time::timeout(wait, exit_rx.wait_for(Option::is_some))
                .await
                .map(|r| r.is_ok())
                .unwrap_or(false);
            if !exited {
                warn!("Backend did not report exit after stop");
            }
        }
    }

    /// Own the child until it exits or a stop is requested
    async fn monitor(
        self: Arc<Self>,
        generation: u64,
        mut child: Child,
        stop_rx: oneshot::Receiver<()>,
        exit_tx: watch::Sender<Option<String>>,
    ) {
        let exited = tokio::select! {
            status = child.wait() => Some(status),
            _ = stop_rx => None,
        };

        match exited {
            Some(status) => {
                let status = match status {
                    Ok(s) => s.to_string(),
                    Err(e) => format!("wait failed: {}", e),
                };
                exit_tx.send_replace(Some(status.clone()));
                self.on_exit(generation, &status);
            }
            None => {
                terminate(&mut child, self.config.shutdown_grace_period()).await;
                exit_tx.send_replace(Some("stopped".to_string()));
            }
        }
    }

    fn on_exit(&self, generation: u64, status: &str) {
        let mut slot = self.slot.lock();
        let state = match slot.backend.as_ref() {
            Some(b) if b.generation == generation => b.state,
            _ => {
                debug!(generation, status, "Exit of a stale activation");
                return;
            }
        };

        match state {
            BackendState::Starting => {
                // The boot task sees the exit and records the failure
                warn!(generation, status, "Backend exited during boot");
            }
            _ => {
                error!(generation, status, "Backend exited unexpectedly");
                self.teardown_locked(&mut slot);
            }
        }
    }
}

async fn wait_for_exit(exit_rx: &mut watch::Receiver<Option<String>>) -> String {
    match exit_rx.wait_for(Option::is_some).await {
        Ok(status) => status.clone().unwrap_or_default(),
        Err(_) => "monitor gone".to_string(),
    }
}

fn exit_status(exit_rx: &watch::Receiver<Option<String>>) -> String {
    exit_rx
        .borrow()
        .clone()
        .unwrap_or_else(|| "unknown".to_string())
}

/// SIGTERM, then SIGKILL after `grace_period`. Errors for an already-dead
/// child are swallowed.
async fn terminate(child: &mut Child, grace_period: Duration) {
    if let Some(pid) = child.id() {
        info!(pid, "Sending SIGTERM to backend");

        #[cfg(unix)]
        unsafe {
            libc::kill(pid as i32, libc::SIGTERM);
        }

        #[cfg(not(unix))]
        {
            let _ = child.start_kill();
        }
    }

    match tokio::time::timeout(grace_period, child.wait()).await {
        Ok(Ok(status)) => {
            info!(?status, "Backend process exited");
        }
        Ok(Err(e)) => {
            warn!(error = %e, "Error waiting for backend to exit");
        }
        Err(_) => {
            warn!(
                grace_period_secs = grace_period.as_secs(),
                "Grace period exceeded, sending SIGKILL"
            );
            let _ = child.kill().await;
        }
    }
}

fn pump_output<R>(reader: R, stream: &'static str, pid: Option<u32>, session: StartupSession, show: bool)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(stream, pid, line = %crate::startup::strip_ansi(&line), "Backend output");
            if show {
                session.append_line(&line);
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::PoolConfig;

    fn test_config(command: &str, args: &[&str]) -> BackendConfig {
        let mut config = BackendConfig::local(command, 1).with_args(
            args.iter().map(|s| s.to_string()).collect(),
        );
        // Nothing listens on port 1, so probes keep failing
        config.host = "127.0.0.1".to_string();
        config.retry.initial_delay_ms = 50;
        config.retry.step_ms = 50;
        config.retry.probe_timeout_ms = 200;
        config.shutdown_grace_period_secs = 1;
        config
    }

    fn supervisor(config: BackendConfig) -> Arc<Supervisor> {
        Supervisor::new(config, Arc::new(ConnectionPool::new(PoolConfig::default())))
    }

    async fn wait_for_state(sup: &Supervisor, state: BackendState) -> bool {
        for _ in 0..100 {
            if sup.state() == state {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    #[test]
    fn test_launch_spec_from_config() {
        let mut env = HashMap::new();
        env.insert("LUME_DRAFTS".to_string(), "true".to_string());
        let config = BackendConfig::local("deno", 3000)
            .with_args(vec!["task".to_string(), "cms".to_string()])
            .with_env(env)
            .with_working_dir("/site");

        let spec = LaunchSpec::from(&config);
        assert_eq!(spec.program, "deno");
        assert_eq!(spec.args, vec!["task", "cms"]);
        assert_eq!(spec.env.get("LUME_DRAFTS").unwrap(), "true");
        assert_eq!(spec.working_dir, Some(PathBuf::from("/site")));
        assert_eq!(spec.port, 3000);
        assert!(!spec.env.contains_key(crate::config::GIT_ENV_VAR));

        let mut config = crate::config::Config {
            backend: config,
            ..Default::default()
        };
        config.git.enabled = true;
        config
            .git
            .options
            .insert("branch".to_string(), toml::Value::String("main".to_string()));
        let spec = LaunchSpec::from(&config.launch_backend().unwrap());
        assert_eq!(spec.env.get("LUME_DRAFTS").unwrap(), "true");
        assert_eq!(
            spec.env.get(crate::config::GIT_ENV_VAR).unwrap(),
            r#"{"branch":"main"}"#
        );
    }

    #[tokio::test]
    async fn test_initial_state_and_noop_stop() {
        let sup = supervisor(test_config("sleep", &["30"]));
        assert_eq!(sup.state(), BackendState::Stopped);
        assert!(sup.pid().is_none());
        assert!(sup.session().is_none());

        // Stopping with nothing running is a no-op
        sup.stop().await;
        assert_eq!(sup.state(), BackendState::Stopped);
        assert_eq!(sup.spawn_count(), 0);
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let sup = supervisor(test_config("/nonexistent/wakegate-backend", &[]));

        let result = sup.start();
        assert!(matches!(result, Err(SupervisorError::SpawnFailure { .. })));
        assert_eq!(sup.state(), BackendState::Stopped);
        assert_eq!(sup.consecutive_failures(), 1);
        assert_eq!(sup.spawn_count(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_starts_spawn_once() {
        let sup = supervisor(test_config("sleep", &["30"]));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let sup = Arc::clone(&sup);
            handles.push(tokio::spawn(async move { sup.start().unwrap() }));
        }

        let mut generations = Vec::new();
        let mut spawned = 0;
        for handle in handles {
            let activation = handle.await.unwrap();
            generations.push(activation.generation);
            if activation.spawned {
                spawned += 1;
            }
        }

        assert_eq!(spawned, 1);
        assert_eq!(sup.spawn_count(), 1);
        assert!(generations.iter().all(|g| *g == generations[0]));
        assert_eq!(sup.state(), BackendState::Starting);
        assert!(sup.pid().is_some());

        sup.stop().await;
        assert_eq!(sup.state(), BackendState::Stopped);
    }

    #[tokio::test]
    async fn test_exit_during_boot_reports_error() {
        let sup = supervisor(test_config("false", &[]));

        let activation = sup.start().unwrap();
        let outcome = activation.outcome().await;

        match outcome {
            Outcome::Failed(message) => assert!(message.contains("exited before becoming ready")),
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert!(activation.session.text().contains("Error:"));
        assert!(wait_for_state(&sup, BackendState::Stopped).await);
        assert_eq!(sup.consecutive_failures(), 1);

        // A later request may retry
        let retry = sup.start().unwrap();
        assert!(retry.spawned);
        assert!(retry.generation > activation.generation);
        retry.outcome().await;
    }

    #[tokio::test]
    async fn test_backend_output_reaches_session_without_colors() {
        let script = "printf '\\033[32mhello\\033[0m\\n'; printf 'warming up\\n' >&2; sleep 30";
        let mut config = test_config("sh", &["-c", script]);
        config.show_output = true;
        let sup = supervisor(config);
        let activation = sup.start().unwrap();

        let mut text = String::new();
        for _ in 0..100 {
            text = activation.session.text();
            if text.contains("hello\n") && text.contains("warming up\n") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        assert!(text.contains("hello\n"), "session text: {:?}", text);
        assert!(text.contains("warming up\n"), "session text: {:?}", text);
        assert!(!text.contains('\x1b'));
        // Output lines never continue a row of progress dots
        assert!(text.lines().any(|line| line == "hello"), "session text: {:?}", text);

        sup.stop().await;
    }

    #[tokio::test]
    async fn test_backend_output_hidden_by_default() {
        let sup = supervisor(test_config("sh", &["-c", "echo hello; sleep 30"]));
        let activation = sup.start().unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!activation.session.text().contains("hello"));

        sup.stop().await;
    }

    #[tokio::test]
    async fn test_stop_during_boot_closes_session() {
        let sup = supervisor(test_config("sleep", &["30"]));
        let activation = sup.start().unwrap();

        sup.stop().await;

        assert_eq!(activation.outcome().await, Outcome::Stopped);
        assert_eq!(sup.state(), BackendState::Stopped);
        // A stop is not a boot failure
        assert_eq!(sup.consecutive_failures(), 0);
    }

    #[tokio::test]
    async fn test_ready_idle_timeout_tears_down() {
        let mut config = test_config("sleep", &["30"]);
        config.idle_timeout_secs = 1;
        let sup = supervisor(config);

        let activation = sup.start().unwrap();
        let (link, _peer) = UpstreamLink::pair();
        assert!(sup.mark_ready(activation.generation, link));

        assert_eq!(sup.state(), BackendState::Ready);
        assert!(sup.broadcaster().is_attached());
        assert!(sup.idle_deadline().is_some());
        assert_eq!(activation.outcome().await, Outcome::Ready);

        assert!(wait_for_state(&sup, BackendState::Stopped).await);
        assert!(!sup.broadcaster().is_attached());
        assert!(sup.idle_deadline().is_none());
    }

    #[tokio::test]
    async fn test_touch_postpones_idle_deadline() {
        let sup = supervisor(test_config("sleep", &["30"]));

        // Not ready: nothing to schedule
        sup.touch();
        assert!(sup.idle_deadline().is_none());

        let activation = sup.start().unwrap();
        let (link, _peer) = UpstreamLink::pair();
        sup.mark_ready(activation.generation, link);

        let first = sup.idle_deadline().unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        sup.touch();
        let second = sup.idle_deadline().unwrap();
        assert!(second > first);

        sup.stop().await;
    }

    #[tokio::test]
    async fn test_idle_expiry_yields_to_later_activity() {
        let sup = supervisor(test_config("sleep", &["30"]));
        let activation = sup.start().unwrap();
        let (link, _peer) = UpstreamLink::pair();
        sup.mark_ready(activation.generation, link);

        // The deadline fired, then a request rescheduled before the expiry ran
        sup.touch();
        sup.expire_idle(activation.generation);
        assert_eq!(sup.state(), BackendState::Ready);
        assert!(sup.broadcaster().is_attached());

        sup.idle.cancel();
        sup.expire_idle(activation.generation);
        assert_eq!(sup.state(), BackendState::Stopped);
        assert!(!sup.broadcaster().is_attached());
    }

    #[tokio::test]
    async fn test_crash_while_ready_tears_down() {
        let sup = supervisor(test_config("sleep", &["0.3"]));

        let activation = sup.start().unwrap();
        let (link, _peer) = UpstreamLink::pair();
        sup.mark_ready(activation.generation, link);
        let _client = sup.broadcaster().attach_downstream().unwrap();

        assert!(wait_for_state(&sup, BackendState::Stopped).await);
        assert!(!sup.broadcaster().is_attached());
        assert_eq!(sup.broadcaster().downstream_count(), 0);
    }

    #[tokio::test]
    async fn test_upstream_loss_tears_down() {
        let sup = supervisor(test_config("sleep", &["30"]));

        let activation = sup.start().unwrap();
        let (link, peer) = UpstreamLink::pair();
        sup.mark_ready(activation.generation, link);
        assert_eq!(sup.state(), BackendState::Ready);

        drop(peer);
        assert!(wait_for_state(&sup, BackendState::Stopped).await);
    }

    #[tokio::test]
    async fn test_await_ready_reports_boot_failure() {
        let sup = supervisor(test_config("false", &[]));
        let activation = sup.start().unwrap();

        match sup.await_ready(activation.generation).await {
            Err(SupervisorError::BootFailed(message)) => {
                assert!(message.contains("exited before becoming ready"))
            }
            Err(SupervisorError::UpstreamUnavailable(_)) => {
                // Boot already failed and the slot was cleared before we looked
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_await_ready_and_invalidate() {
        let sup = supervisor(test_config("sleep", &["30"]));
        let activation = sup.start().unwrap();

        let waiter = {
            let sup = Arc::clone(&sup);
            tokio::spawn(async move { sup.await_ready(activation.generation).await })
        };

        let (link, _peer) = UpstreamLink::pair();
        sup.mark_ready(activation.generation, link);
        waiter.await.unwrap().unwrap();
        sup.await_ready(activation.generation).await.unwrap();

        // Only the live generation can be invalidated
        assert!(!sup.invalidate(activation.generation + 1, "reload"));
        assert_eq!(sup.state(), BackendState::Ready);
        assert!(sup.invalidate(activation.generation, "reload"));
        assert_eq!(sup.state(), BackendState::Stopped);
        assert!(!sup.invalidate(activation.generation, "reload"));
    }

    #[tokio::test]
    async fn test_stale_generation_is_ignored() {
        let sup = supervisor(test_config("sleep", &["30"]));

        let first = sup.start().unwrap();
        sup.stop().await;
        let second = sup.start().unwrap();

        let (link, _peer) = UpstreamLink::pair();
        assert!(!sup.mark_ready(first.generation, link));
        assert_eq!(sup.state(), BackendState::Starting);
        assert!(!sup.stop_if(first.generation, BackendState::Starting, "test"));
        assert_eq!(sup.generation(), Some(second.generation));

        sup.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_circuit_breaker_refuses_then_recovers() {
        let mut config = test_config("/nonexistent/wakegate-backend", &[]);
        config.retry.max_boot_failures = 2;
        config.retry.boot_failure_cooldown_secs = 30;
        let sup = supervisor(config);

        assert!(matches!(sup.start(), Err(SupervisorError::SpawnFailure { .. })));
        assert!(matches!(sup.start(), Err(SupervisorError::SpawnFailure { .. })));

        match sup.start() {
            Err(SupervisorError::CircuitOpen { failures, retry_in }) => {
                assert_eq!(failures, 2);
                assert!(retry_in <= Duration::from_secs(30));
            }
            other => panic!("expected open circuit, got {:?}", other.map(|a| a.generation)),
        }
        assert_eq!(sup.state(), BackendState::Failed);

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(sup.state(), BackendState::Stopped);
        assert!(matches!(sup.start(), Err(SupervisorError::SpawnFailure { .. })));
    }
}
