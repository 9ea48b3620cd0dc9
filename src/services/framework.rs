//! Service framework
//!
//! Long-running background loops (job workers, the artifact reaper) implement
//! [`Service`] and are driven by a [`ServiceManager`], which starts them in
//! dependency order, restarts failed ones according to their
//! [`RestartPolicy`], and stops them all on a single broadcast signal.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;

// ============================================================================
// Service Trait
// ============================================================================

/// A background loop managed by [`ServiceManager`]
#[async_trait::async_trait]
pub trait Service: Send + Sync {
    /// Run until `shutdown` fires or the service fails
    async fn start(&self, shutdown: broadcast::Receiver<()>) -> Result<(), ServiceError>;

    /// Unique name, used for dependencies and logs
    fn name(&self) -> &'static str;

    /// Current status
    fn status(&self) -> ServiceStatus;

    /// Services that must be running before this one starts
    fn dependencies(&self) -> Vec<&'static str> {
        vec![]
    }

    /// What to do when the service fails
    fn restart_policy(&self) -> RestartPolicy {
        RestartPolicy::OnFailure {
            max_retries: 3,
            backoff: Duration::from_secs(5),
        }
    }
}

// ============================================================================
// Service Status
// ============================================================================

/// Status of a service
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "reason")]
pub enum ServiceStatus {
    /// Initializing
    Starting,
    /// Running normally
    Running,
    /// Draining after the shutdown signal
    Stopping,
    /// Stopped cleanly
    Stopped,
    /// Stopped with an error
    Failed(String),
}

impl ServiceStatus {
    /// Whether the service is doing its job
    pub fn is_healthy(&self) -> bool {
        matches!(self, ServiceStatus::Running)
    }

    /// Whether the service has stopped, cleanly or not
    pub fn is_stopped(&self) -> bool {
        matches!(self, ServiceStatus::Stopped | ServiceStatus::Failed(_))
    }
}

// ============================================================================
// Restart Policy
// ============================================================================

/// Policy for restarting failed services
#[derive(Debug, Clone)]
pub enum RestartPolicy {
    /// Leave the service failed
    Never,
    /// Restart after a fixed delay, without limit
    Always {
        /// Delay before each restart
        backoff: Duration,
    },
    /// Restart a bounded number of times
    OnFailure {
        /// Restart attempts allowed
        max_retries: u32,
        /// Base delay, multiplied by the attempt number
        backoff: Duration,
    },
}

// ============================================================================
// Service Error
// ============================================================================

/// Errors raised by services and the manager
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    /// Service could not initialize
    #[error("Service initialization failed: {0}")]
    InitializationFailed(String),

    /// Service failed while running
    #[error("Service runtime error: {0}")]
    RuntimeError(String),

    /// A dependency is missing, not running, or circular
    #[error("Dependency not satisfied: {0}")]
    DependencyError(String),

    /// A service with this name is already registered
    #[error("Service already registered: {0}")]
    AlreadyRegistered(String),

    /// `start_all` was called twice
    #[error("Services already running")]
    AlreadyRunning,

    /// No service with this name is registered
    #[error("Service not found: {0}")]
    NotFound(String),
}

impl From<crate::error::Error> for ServiceError {
    fn from(e: crate::error::Error) -> Self {
        ServiceError::RuntimeError(e.to_string())
    }
}

// ============================================================================
// Service Config
// ============================================================================

/// Configuration of the service manager
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// How long shutdown waits for services to stop
    pub shutdown_timeout: Duration,
    /// Restart failed services according to their policy
    pub auto_restart: bool,
    /// How often the supervisor looks for failed services
    pub supervise_interval: Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            shutdown_timeout: Duration::from_secs(30),
            auto_restart: true,
            supervise_interval: Duration::from_secs(10),
        }
    }
}

/// Health summary of every registered service
#[derive(Debug, Clone, Serialize)]
pub struct ServiceHealth {
    /// Whether every service is running
    pub healthy: bool,
    /// Status by service name
    pub services: BTreeMap<&'static str, ServiceStatus>,
    /// Seconds since each service last started
    pub uptime_secs: BTreeMap<&'static str, u64>,
}

// ============================================================================
// Service Manager
// ============================================================================

struct ServiceHandle {
    service: Arc<dyn Service>,
    task: Option<JoinHandle<Result<(), ServiceError>>>,
    restart_count: u32,
    started_at: Option<Instant>,
}

/// Starts, supervises and stops registered services
pub struct ServiceManager {
    config: ServiceConfig,
    services: RwLock<HashMap<&'static str, ServiceHandle>>,
    shutdown_tx: broadcast::Sender<()>,
    running: RwLock<bool>,
}

/// Shared service manager
pub type SharedServiceManager = Arc<ServiceManager>;

impl ServiceManager {
    /// Create a manager
    pub fn new(config: ServiceConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            services: RwLock::new(HashMap::new()),
            shutdown_tx,
            running: RwLock::new(false),
        }
    }

    /// Manager configuration
    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Register a service
    pub fn register(&self, service: Arc<dyn Service>) -> Result<(), ServiceError> {
        let name = service.name();
        let mut services = self.services.write();
        if services.contains_key(name) {
            return Err(ServiceError::AlreadyRegistered(name.to_string()));
        }
        services.insert(
            name,
            ServiceHandle {
                service,
                task: None,
                restart_count: 0,
                started_at: None,
            },
        );
        tracing::debug!(service = name, "Service registered");
        Ok(())
    }

    /// Fail if any declared dependency is not registered
    pub fn validate_dependencies(&self) -> Result<(), ServiceError> {
        let services = self.services.read();
        let mut missing = Vec::new();
        for (name, handle) in services.iter() {
            for dep in handle.service.dependencies() {
                if !services.contains_key(dep) {
                    missing.push(format!(
                        "'{}' depends on '{}' which is not registered",
                        name, dep
                    ));
                }
            }
        }
        if missing.is_empty() {
            Ok(())
        } else {
            Err(ServiceError::DependencyError(missing.join("; ")))
        }
    }

    /// Start every service in dependency order
    pub async fn start_all(&self) -> Result<(), ServiceError> {
        self.validate_dependencies()?;
        {
            let mut running = self.running.write();
            if *running {
                return Err(ServiceError::AlreadyRunning);
            }
            *running = true;
        }
        for name in self.topological_sort()? {
            self.start_service(name).await?;
        }
        tracing::info!(services = self.services.read().len(), "All services started");
        Ok(())
    }

    /// Start one service once its dependencies are running
    pub async fn start_service(&self, name: &'static str) -> Result<(), ServiceError> {
        let service = {
            let mut services = self.services.write();
            let service = services
                .get(name)
                .map(|h| h.service.clone())
                .ok_or_else(|| ServiceError::NotFound(name.to_string()))?;

            for dep in service.dependencies() {
                let running = services
                    .get(dep)
                    .map(|h| h.service.status().is_healthy())
                    .ok_or_else(|| ServiceError::DependencyError(format!("'{}' not found", dep)))?;
                if !running {
                    return Err(ServiceError::DependencyError(format!("'{}' is not running", dep)));
                }
            }

            let shutdown_rx = self.shutdown_tx.subscribe();
            let task_service = service.clone();
            let task = tokio::spawn(async move { task_service.start(shutdown_rx).await });
            if let Some(handle) = services.get_mut(name) {
                handle.task = Some(task);
                handle.started_at = Some(Instant::now());
            }
            service
        };

        // Dependents check the status, so give the loop a moment to report Running
        let waited = Instant::now();
        while waited.elapsed() < Duration::from_millis(100) && !service.status().is_healthy() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tracing::debug!(service = name, status = ?service.status(), "Service started");
        Ok(())
    }

    /// Signal shutdown and wait for every service to stop
    pub async fn shutdown(&self) -> Result<(), ServiceError> {
        tracing::info!("Initiating graceful shutdown");
        let _ = self.shutdown_tx.send(());

        let tasks: Vec<(&'static str, JoinHandle<Result<(), ServiceError>>)> = {
            let mut services = self.services.write();
            services
                .iter_mut()
                .filter_map(|(name, handle)| handle.task.take().map(|task| (*name, task)))
                .collect()
        };

        let deadline = Instant::now() + self.config.shutdown_timeout;
        for (name, task) in tasks {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match tokio::time::timeout(remaining, task).await {
                Ok(Ok(Ok(()))) => tracing::debug!(service = name, "Service stopped"),
                Ok(Ok(Err(e))) => {
                    tracing::warn!(service = name, error = %e, "Service stopped with error")
                },
                Ok(Err(e)) => tracing::error!(service = name, error = %e, "Service task panicked"),
                Err(_) => tracing::warn!(service = name, "Service shutdown timed out"),
            }
        }

        *self.running.write() = false;
        tracing::info!("Shutdown complete");
        Ok(())
    }

    /// Status of every service
    pub fn status(&self) -> HashMap<&'static str, ServiceStatus> {
        self.services
            .read()
            .iter()
            .map(|(name, handle)| (*name, handle.service.status()))
            .collect()
    }

    /// Status of one service
    pub fn service_status(&self, name: &str) -> Option<ServiceStatus> {
        self.services.read().get(name).map(|h| h.service.status())
    }

    /// Time since a service last started
    pub fn service_uptime(&self, name: &str) -> Option<Duration> {
        self.services
            .read()
            .get(name)
            .and_then(|h| h.started_at.map(|started| started.elapsed()))
    }

    /// Whether every service is running
    pub fn is_healthy(&self) -> bool {
        self.services.read().values().all(|h| h.service.status().is_healthy())
    }

    /// Health summary for the health endpoint
    pub fn health(&self) -> ServiceHealth {
        let services = self.services.read();
        ServiceHealth {
            healthy: services.values().all(|h| h.service.status().is_healthy()),
            services: services
                .iter()
                .map(|(name, h)| (*name, h.service.status()))
                .collect(),
            uptime_secs: services
                .iter()
                .filter_map(|(name, h)| h.started_at.map(|s| (*name, s.elapsed().as_secs())))
                .collect(),
        }
    }

    /// Restart failed services according to their policies
    ///
    /// Returns the names of the services restarted.
    pub async fn check_and_restart_failed(&self) -> Vec<&'static str> {
        if !self.config.auto_restart {
            return Vec::new();
        }

        let failed: Vec<(&'static str, RestartPolicy, u32)> = self
            .services
            .read()
            .iter()
            .filter(|(_, h)| matches!(h.service.status(), ServiceStatus::Failed(_)))
            .map(|(name, h)| (*name, h.service.restart_policy(), h.restart_count))
            .collect();

        let mut restarted = Vec::new();
        for (name, policy, restart_count) in failed {
            let delay = match policy {
                RestartPolicy::Never => None,
                RestartPolicy::Always { backoff } => Some(backoff),
                RestartPolicy::OnFailure {
                    max_retries,
                    backoff,
                } if restart_count < max_retries => Some(backoff * (restart_count + 1)),
                RestartPolicy::OnFailure { max_retries, .. } => {
                    tracing::warn!(
                        service = name,
                        attempts = restart_count,
                        max = max_retries,
                        "Service exceeded restart attempts"
                    );
                    None
                },
            };
            let Some(delay) = delay else {
                continue;
            };
            tokio::time::sleep(delay).await;
            if let Some(handle) = self.services.write().get_mut(name) {
                handle.restart_count += 1;
            }
            match self.start_service(name).await {
                Ok(()) => {
                    tracing::info!(service = name, "Service restarted");
                    restarted.push(name);
                },
                Err(e) => tracing::error!(service = name, error = %e, "Failed to restart service"),
            }
        }
        restarted
    }

    /// Restart failed services every `supervise_interval` until shutdown
    pub async fn supervise(&self) {
        let mut shutdown = self.shutdown_tx.subscribe();
        let mut ticker = tokio::time::interval(self.config.supervise_interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = ticker.tick() => {
                    let restarted = self.check_and_restart_failed().await;
                    if !restarted.is_empty() {
                        tracing::info!(services = ?restarted, "Supervisor restarted services");
                    }
                }
            }
        }
    }

    fn topological_sort(&self) -> Result<Vec<&'static str>, ServiceError> {
        let services = self.services.read();
        let mut order = Vec::new();
        let mut visited = HashMap::new();
        let mut names: Vec<&'static str> = services.keys().copied().collect();
        names.sort_unstable();
        for name in names {
            Self::visit(name, &services, &mut visited, &mut order)?;
        }
        Ok(order)
    }

    /// Depth-first visit; `false` marks a node on the current path
    fn visit(
        name: &'static str,
        services: &HashMap<&'static str, ServiceHandle>,
        visited: &mut HashMap<&'static str, bool>,
        order: &mut Vec<&'static str>,
    ) -> Result<(), ServiceError> {
        match visited.get(name) {
            Some(true) => return Ok(()),
            Some(false) => {
                return Err(ServiceError::DependencyError(format!(
                    "circular dependency at '{}'",
                    name
                )))
            },
            None => {},
        }
        visited.insert(name, false);
        if let Some(handle) = services.get(name) {
            for dep in handle.service.dependencies() {
                Self::visit(dep, services, visited, order)?;
            }
        }
        visited.insert(name, true);
        order.push(name);
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
