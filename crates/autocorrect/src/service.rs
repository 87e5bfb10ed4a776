//! LookupService: transport-agnostic entry point for suggestion lookups.
//!
//! This service owns:
//! - Startup of the suggestion process (readiness wait before serving)
//! - The dispatcher handle (queue, pipe conversation, restarts)
//! - Input validation for `lookup`
//!
//! Transports (HTTP) delegate to this service and map `LookupError` to
//! their own status codes.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::sync::{Mutex, watch};

use crate::dispatcher::{DispatcherHandle, PendingLookup, spawn_dispatcher};
use crate::error::{LookupError, StartupError};
use crate::health::{Health, ProcessInfo};
use crate::queue::LookupResult;
use crate::supervisor::{ProcessSpawner, Readiness, Supervisor, SupervisorConfig};
use crate::version::VersionInfo;

pub use crate::dispatcher::RestartPolicy;

/// Configuration for the lookup service.
#[derive(Clone)]
pub struct ServiceConfig {
    pub supervisor: SupervisorConfig,
    /// Bound on write plus response wait for the in-flight request. `None` waits forever.
    pub response_timeout: Option<Duration>,
    pub restart_policy: RestartPolicy,
}

impl ServiceConfig {
    pub fn new(spawner: Arc<dyn ProcessSpawner>) -> Self {
        Self {
            supervisor: SupervisorConfig::new(spawner),
            response_timeout: Some(Duration::from_secs(30)),
            restart_policy: RestartPolicy::default(),
        }
    }

    pub fn with_readiness(mut self, readiness: Readiness) -> Self {
        self.supervisor = self.supervisor.with_readiness(readiness);
        self
    }

    pub fn with_max_frame_length(mut self, max: usize) -> Self {
        self.supervisor = self.supervisor.with_max_frame_length(max);
        self
    }

    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.supervisor = self.supervisor.with_stop_grace(grace);
        self
    }

    pub fn with_response_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.response_timeout = timeout;
        self
    }

    pub fn with_restart_policy(mut self, policy: RestartPolicy) -> Self {
        self.restart_policy = policy;
        self
    }
}

/// Snapshot of service health for transports to query.
#[derive(Debug, Clone)]
pub struct HealthSnapshot {
    pub state: Health,
    pub process: Option<ProcessInfo>,
    pub version: VersionInfo,
}

impl HealthSnapshot {
    pub fn is_ready(&self) -> bool {
        self.state.accepts_lookups()
    }
}

/// Transport-agnostic lookup service.
///
/// Created with `new()`, then `start()` spawns the process and blocks until
/// it is ready. Lookups before a successful start fail with
/// `ProcessUnavailable`.
pub struct LookupService {
    config: ServiceConfig,
    supervisor: Arc<Supervisor>,
    dispatcher: OnceLock<DispatcherHandle>,
    /// Serializes `start()` calls.
    starting: Mutex<()>,
    /// Health until the dispatcher takes over publishing it.
    boot_health: watch::Sender<Health>,
    version: VersionInfo,
}

impl LookupService {
    pub fn new(config: ServiceConfig) -> Self {
        let supervisor = Arc::new(Supervisor::new(config.supervisor.clone()));
        let (boot_health, _) = watch::channel(Health::Unknown);
        Self {
            config,
            supervisor,
            dispatcher: OnceLock::new(),
            starting: Mutex::new(()),
            boot_health,
            version: VersionInfo::new(),
        }
    }

    pub fn with_version(mut self, version: VersionInfo) -> Self {
        self.version = version;
        self
    }

    /// Spawn the suggestion process and begin dispatching.
    ///
    /// A process that exits or fails its probe during warm-up is a
    /// `StartupError`; the service then stays unavailable.
    pub async fn start(&self) -> Result<(), StartupError> {
        let _guard = self.starting.lock().await;
        if self.dispatcher.get().is_some() {
            tracing::debug!("Lookup service already started");
            return Ok(());
        }

        self.boot_health.send_replace(Health::Starting);
        let process = match self.supervisor.start().await {
            Ok(process) => process,
            Err(e) => {
                self.boot_health.send_replace(Health::Defunct);
                return Err(e);
            }
        };

        let handle = spawn_dispatcher(
            Arc::clone(&self.supervisor),
            process,
            self.config.restart_policy.clone(),
            self.config.response_timeout,
        );
        // Only ever set under the start guard.
        let _ = self.dispatcher.set(handle);

        self.boot_health.send_replace(Health::Ready);
        tracing::info!("Lookup service ready");
        Ok(())
    }

    /// Append a lookup for `word` to the queue without validating it.
    ///
    /// The request is queued as soon as this returns; the returned future
    /// settles with the process's answer.
    pub fn enqueue(&self, word: impl Into<String>) -> PendingLookup {
        match self.dispatcher.get() {
            Some(dispatcher) => dispatcher.enqueue(word),
            None => PendingLookup::unavailable(),
        }
    }

    /// Look up suggestions for `word`.
    ///
    /// Empty or whitespace-only input fails with `MissingInput` without
    /// touching the queue.
    pub async fn lookup(&self, word: &str) -> LookupResult {
        if word.trim().is_empty() {
            return Err(LookupError::MissingInput);
        }
        self.enqueue(word).await
    }

    pub fn health(&self) -> HealthSnapshot {
        let (state, process) = match self.dispatcher.get() {
            Some(dispatcher) => (dispatcher.health(), dispatcher.process_info()),
            None => (*self.boot_health.borrow(), None),
        };
        HealthSnapshot {
            state,
            process,
            version: self.version.clone(),
        }
    }

    /// Fail pending lookups and stop the suggestion process.
    pub async fn shutdown(&self) {
        match self.dispatcher.get() {
            Some(dispatcher) => dispatcher.shutdown().await,
            None => self.supervisor.stop(),
        }
        self.boot_health.send_replace(Health::Stopped);
    }
}
