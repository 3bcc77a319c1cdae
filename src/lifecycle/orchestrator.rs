//! Lifecycle Orchestrator: brings the graph up and down.
//!
//! # Initialization
//!
//! A central loop keeps a ready queue of components whose children have all
//! settled (`Live` or `Failed`) and spawns one task per ready component onto a
//! [`JoinSet`]. A [`Semaphore`] bounds how many constructions run at once.
//! Each task:
//!
//! 1. waits for a worker permit,
//! 2. checks the cancel flag (a cancelled component stays `Declared`),
//! 3. moves to `Initializing` and constructs the driver (leaf drivers on the
//!    blocking pool, composites through the [`MultiplexComposer`]),
//! 4. applies property overrides in key order,
//! 5. registers the proxy, then moves to `Live`.
//!
//! The loop owns failure handling: it marks the component `Failed`, warns its
//! affects neighbours, and releases the composite parent once its last child
//! settled. A composite with a failed child goes straight to `Failed` with
//! [`ModelError::DependencyFailed`] and is never constructed.
//!
//! # Shutdown
//!
//! Strict reverse of the order in which components became `Live`. Every
//! driver gets its shutdown call, each bounded by the configured timeout;
//! errors are collected, never returned early.

use super::report::{FailedComponent, InitReport, InitWarning, ShutdownReport};
use super::state::{ComponentState, StateTable};
use crate::component::ComponentRecord;
use crate::config::{EngineConfig, RetryPolicy, MAX_WORKERS};
use crate::driver::{DriverCatalog, DriverProxy, DynDriver, ProxyKind};
use crate::error::{DriverError, ModelError, ModelResult};
use crate::graph::ComponentGraph;
use crate::multiplex::MultiplexComposer;
use crate::registry::RoleRegistry;
use chrono::Utc;
use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::{self, JoinError, JoinSet};
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Global abort signal for an initialization run.
///
/// Cancelling stops new constructions from starting; constructions already in
/// flight finish or fail on their own. The flag stays set until
/// [`reset`](Self::reset).
#[derive(Clone, Debug, Default)]
pub struct CancelHandle {
    flag: Arc<AtomicBool>,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        if !self.flag.swap(true, Ordering::SeqCst) {
            info!("initialization cancelled");
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Clear the flag so a later run can proceed.
    pub fn reset(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

type Constructed = ModelResult<(u64, Arc<DriverProxy>)>;

/// Sole owner of every live [`DriverProxy`].
pub struct Orchestrator {
    graph: Arc<ComponentGraph>,
    catalog: Arc<DriverCatalog>,
    registry: Arc<RoleRegistry>,
    states: Arc<StateTable>,
    config: EngineConfig,
    cancel: CancelHandle,
    /// Live proxies in the order they became live.
    live: Mutex<Vec<Arc<DriverProxy>>>,
}

impl Orchestrator {
    pub fn new(
        graph: Arc<ComponentGraph>,
        catalog: Arc<DriverCatalog>,
        registry: Arc<RoleRegistry>,
        config: EngineConfig,
    ) -> Self {
        let states = Arc::new(StateTable::new(
            graph.records().iter().map(|r| r.name.as_str()),
        ));
        Self {
            graph,
            catalog,
            registry,
            states,
            config,
            cancel: CancelHandle::new(),
            live: Mutex::new(Vec::new()),
        }
    }

    /// Handle that aborts the current (or next) initialization run.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Current state of a component.
    pub fn state(&self, name: &str) -> Option<ComponentState> {
        self.states.get(name)
    }

    /// State table with transition history.
    pub fn states(&self) -> &Arc<StateTable> {
        &self.states
    }

    /// Live components in the order they became live.
    pub fn live_order(&self) -> Vec<String> {
        let mut live: Vec<(u64, String)> = self
            .states
            .in_state(ComponentState::Live)
            .into_iter()
            .filter_map(|name| {
                self.states
                    .seq_of(&name, ComponentState::Live)
                    .map(|seq| (seq, name))
            })
            .collect();
        live.sort();
        live.into_iter().map(|(_, name)| name).collect()
    }

    /// Bring every component up, children before their composite.
    ///
    /// Per-component failures end up in the report; this only errors if the
    /// orchestrator still owns live components from an earlier run.
    pub async fn initialize(&self) -> ModelResult<InitReport> {
        let mut owned = self
            .live
            .try_lock()
            .map_err(|_| ModelError::AlreadyRunning)?;
        if !owned.is_empty() {
            return Err(ModelError::AlreadyRunning);
        }

        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let order: Vec<String> = self
            .graph
            .init_order()
            .into_iter()
            .map(String::from)
            .collect();
        self.states.reset(order.iter().map(String::as_str));
        info!(
            %run_id,
            components = order.len(),
            max_workers = self.config.max_workers,
            "initialization started"
        );

        let mut pending: HashMap<String, usize> = HashMap::new();
        let mut ready = VecDeque::new();
        for name in &order {
            let children = self.graph.children_of(name).len();
            if children == 0 {
                ready.push_back(name.clone());
            } else {
                pending.insert(name.clone(), children);
            }
        }

        let workers = Arc::new(Semaphore::new(self.config.max_workers.clamp(1, MAX_WORKERS)));
        let mut tasks: JoinSet<Constructed> = JoinSet::new();
        let mut running: HashMap<task::Id, String> = HashMap::new();
        let mut live: Vec<(u64, Arc<DriverProxy>)> = Vec::new();
        let mut failed = Vec::new();
        let mut warnings = Vec::new();

        loop {
            while let Some(name) = ready.pop_front() {
                let children = self.graph.children_of(&name);
                if children
                    .iter()
                    .any(|child| !self.states.get(child).is_some_and(ComponentState::is_settled))
                {
                    // a cancelled child leaves its composite Declared too
                    debug!(component = %name, "children not settled, run cancelled");
                    self.release_parent(&name, &mut pending, &mut ready);
                    continue;
                }
                let failed_child = children
                    .into_iter()
                    .find(|child| self.states.get(child) == Some(ComponentState::Failed))
                    .map(String::from);
                if let Some(dependency) = failed_child {
                    let cause = ModelError::DependencyFailed {
                        component: name.clone(),
                        dependency,
                    };
                    self.record_failure(&name, cause, &mut failed, &mut warnings);
                    self.release_parent(&name, &mut pending, &mut ready);
                    continue;
                }

                let Some(record) = self.graph.record(&name).cloned() else {
                    continue;
                };
                let job = ConstructJob {
                    record,
                    catalog: Arc::clone(&self.catalog),
                    registry: Arc::clone(&self.registry),
                    states: Arc::clone(&self.states),
                    workers: Arc::clone(&workers),
                    cancel: self.cancel.clone(),
                    retry: self.config.retry.clone(),
                };
                let handle = tasks.spawn(job.run());
                running.insert(handle.id(), name);
            }

            let Some(joined) = tasks.join_next_with_id().await else {
                break;
            };
            let (id, outcome) = match joined {
                Ok((id, outcome)) => (id, Ok(outcome)),
                Err(err) => (err.id(), Err(task_failure(err))),
            };
            let Some(name) = running.remove(&id) else {
                continue;
            };
            let outcome = outcome.unwrap_or_else(|reason| {
                Err(ModelError::driver(name.clone(), DriverError::new(reason)))
            });

            match outcome {
                Ok((seq, proxy)) => {
                    info!(component = %name, role = %proxy.role(), "component live");
                    live.push((seq, proxy));
                }
                Err(ModelError::Cancelled(_)) => {
                    debug!(component = %name, "not started, run cancelled");
                }
                Err(cause) => self.record_failure(&name, cause, &mut failed, &mut warnings),
            }
            self.release_parent(&name, &mut pending, &mut ready);
        }

        live.sort_by_key(|(seq, _)| *seq);
        let live_names: Vec<String> = live.iter().map(|(_, p)| p.name().to_string()).collect();
        owned.extend(live.into_iter().map(|(_, proxy)| proxy));

        let cancelled: Vec<String> = order
            .iter()
            .filter(|name| self.states.get(name) == Some(ComponentState::Declared))
            .cloned()
            .collect();

        info!(
            %run_id,
            live = live_names.len(),
            failed = failed.len(),
            warnings = warnings.len(),
            cancelled = cancelled.len(),
            "initialization finished"
        );
        Ok(InitReport {
            run_id,
            started_at,
            finished_at: Utc::now(),
            live: live_names,
            failed,
            warnings,
            cancelled,
        })
    }

    /// Shut every live component down in reverse live order.
    ///
    /// Never stops early: each component is attempted even if an earlier one
    /// failed or timed out.
    pub async fn shutdown(&self) -> ShutdownReport {
        let proxies: Vec<Arc<DriverProxy>> = std::mem::take(&mut *self.live.lock().await);
        let mut report = ShutdownReport::default();
        info!(components = proxies.len(), "shutdown started");

        for proxy in proxies.into_iter().rev() {
            let name = proxy.name().to_string();
            debug!(component = %name, kind = ?proxy.kind(), "stopping");
            if let Err(err) = self.states.transition(&name, ComponentState::ShuttingDown) {
                report.errors.push(err);
            }
            if let Err(err) = self.stop_driver(&proxy).await {
                warn!(component = %name, error = %err, "shutdown error");
                report.errors.push(err);
            }
            self.registry.deregister(&name);
            if let Err(err) = self.states.transition(&name, ComponentState::Shutdown) {
                report.errors.push(err);
            }
            report.stopped.push(name);
        }

        info!(
            stopped = report.stopped.len(),
            errors = report.errors.len(),
            "shutdown finished"
        );
        report
    }

    /// Take a live component out of service after a runtime fault.
    ///
    /// The component is deregistered, its driver shut down best-effort and its
    /// state set to `Failed`. Composites built on it stop resolving it.
    pub async fn mark_failed(&self, name: &str, cause: &ModelError) -> ModelResult<()> {
        let proxy = {
            let mut live = self.live.lock().await;
            let index = live
                .iter()
                .position(|p| p.name() == name)
                .ok_or_else(|| ModelError::NotFound(name.to_string()))?;
            live.remove(index)
        };
        error!(component = %name, cause = %cause, "live component failed");
        self.registry.deregister(name);
        self.states.transition(name, ComponentState::Failed)?;
        if let Err(err) = self.stop_driver(&proxy).await {
            warn!(component = %name, error = %err, "shutdown after fault failed");
        }
        Ok(())
    }

    async fn stop_driver(&self, proxy: &DriverProxy) -> ModelResult<()> {
        let limit = self.config.shutdown_timeout();
        match timeout(limit, proxy.shutdown()).await {
            Ok(result) => result,
            Err(_) => Err(ModelError::driver(
                proxy.name(),
                DriverError::new(format!(
                    "shutdown timed out after {} ms",
                    self.config.shutdown_timeout_ms
                )),
            )),
        }
    }

    fn record_failure(
        &self,
        name: &str,
        cause: ModelError,
        failed: &mut Vec<FailedComponent>,
        warnings: &mut Vec<InitWarning>,
    ) {
        if self.states.get(name) != Some(ComponentState::Failed) {
            if let Err(err) = self.states.transition(name, ComponentState::Failed) {
                warn!(component = %name, error = %err, "could not mark failed");
            }
        }
        error!(component = %name, cause = %cause, "initialization failed");

        let parent = self.graph.parent_of(name);
        let children = self.graph.children_of(name);
        for neighbour in self.graph.affects_neighbours(name) {
            if Some(neighbour) == parent || children.contains(&neighbour) {
                continue;
            }
            warn!(component = %neighbour, dependency = %name, "degraded dependency");
            warnings.push(InitWarning::DegradedDependency {
                component: neighbour.to_string(),
                dependency: name.to_string(),
            });
        }

        failed.push(FailedComponent {
            name: name.to_string(),
            cause,
        });
    }

    fn release_parent(
        &self,
        name: &str,
        pending: &mut HashMap<String, usize>,
        ready: &mut VecDeque<String>,
    ) {
        let Some(parent) = self.graph.parent_of(name) else {
            return;
        };
        if let Some(count) = pending.get_mut(parent) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                pending.remove(parent);
                ready.push_back(parent.to_string());
            }
        }
    }
}

/// Everything one initialization task needs, detached from the orchestrator.
struct ConstructJob {
    record: ComponentRecord,
    catalog: Arc<DriverCatalog>,
    registry: Arc<RoleRegistry>,
    states: Arc<StateTable>,
    workers: Arc<Semaphore>,
    cancel: CancelHandle,
    retry: RetryPolicy,
}

impl ConstructJob {
    async fn run(self) -> Constructed {
        let name = self.record.name.clone();
        let _permit = self
            .workers
            .acquire()
            .await
            .map_err(|_| ModelError::Cancelled(name.clone()))?;
        if self.cancel.is_cancelled() {
            return Err(ModelError::Cancelled(name));
        }

        self.states.transition(&name, ComponentState::Initializing)?;
        debug!(component = %name, class = %self.record.driver_class, "initializing");

        let proxy = if self.record.is_composite() {
            let actuator = MultiplexComposer::compose(&self.record, &self.registry)?;
            DriverProxy::new(&self.record, ProxyKind::Composite, Arc::new(actuator))
        } else {
            let driver = self.build_leaf().await?;
            DriverProxy::new(&self.record, ProxyKind::Leaf, driver)
        };
        let proxy = Arc::new(proxy);

        for (property, value) in &self.record.properties {
            if let Err(err) = proxy.apply_property(property, value).await {
                if let Err(cleanup) = proxy.shutdown().await {
                    warn!(component = %name, error = %cleanup, "cleanup after property failure failed");
                }
                return Err(err);
            }
        }

        self.registry.register(&proxy);
        match self.states.transition(&name, ComponentState::Live) {
            Ok(seq) => Ok((seq, proxy)),
            Err(err) => {
                self.registry.deregister(&name);
                Err(err)
            }
        }
    }

    /// Construct a leaf driver off the async workers, retrying per policy.
    async fn build_leaf(&self) -> ModelResult<DynDriver> {
        let attempts = self.retry.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            let catalog = Arc::clone(&self.catalog);
            let record = self.record.clone();
            let result = tokio::task::spawn_blocking(move || catalog.build(&record))
                .await
                .map_err(|err| {
                    ModelError::driver(
                        self.record.name.clone(),
                        DriverError::new(format!("driver construction panicked: {}", err)),
                    )
                })?;

            match result {
                Ok(driver) => return Ok(driver),
                Err(err @ ModelError::UnknownDriverClass { .. }) => return Err(err),
                Err(err) if attempt < attempts => {
                    warn!(
                        component = %self.record.name,
                        attempt,
                        error = %err,
                        "construction failed, retrying"
                    );
                    sleep(self.retry.backoff()).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// Why a task ended without producing an outcome.
fn task_failure(err: JoinError) -> String {
    if err.is_panic() {
        format!("initialization panicked: {}", panic_message(err.into_panic().as_ref()))
    } else {
        "initialization task aborted".to_string()
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::Role;
    use crate::driver::simulated::{SimulatedCamera, SimulatedLight, SimulatedStage};
    use crate::driver::{builder, Driver};
    use crate::multiplex::MULTIPLEX_CLASS;
    use async_trait::async_trait;
    use serde_json::Value;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use tracing_test::traced_test;

    fn orchestrator(records: Vec<ComponentRecord>, catalog: DriverCatalog) -> Orchestrator {
        let graph = Arc::new(ComponentGraph::build(records).unwrap());
        Orchestrator::new(
            graph,
            Arc::new(catalog),
            Arc::new(RoleRegistry::new()),
            EngineConfig::default(),
        )
    }

    fn stage(name: &str) -> ComponentRecord {
        ComponentRecord::new(name, SimulatedStage::CLASS, Role::STAGE)
    }

    #[tokio::test]
    async fn test_failed_child_fails_composite() {
        let records = vec![
            stage("A").with_init(json!({ "fail": "no controller" })),
            ComponentRecord::new("B", MULTIPLEX_CLASS, Role::ALIGN).with_child("a", "A"),
        ];
        let orch = orchestrator(records, DriverCatalog::with_simulated());
        let report = orch.initialize().await.unwrap();

        assert!(report.live.is_empty());
        assert_eq!(report.failed_names(), vec!["A", "B"]);
        assert_eq!(
            report.failure_of("B"),
            Some(&ModelError::DependencyFailed {
                component: "B".into(),
                dependency: "A".into()
            })
        );
        assert!(orch.registry.lookup_by_role(Role::ALIGN).is_empty());
        // B never left Declared before failing
        let b_history: Vec<_> = orch
            .states()
            .history()
            .into_iter()
            .filter(|t| t.component == "B")
            .collect();
        assert_eq!(b_history.len(), 1);
        assert_eq!(b_history[0].from, ComponentState::Declared);
    }

    #[tokio::test]
    async fn test_affects_neighbours_get_warnings() {
        let records = vec![
            ComponentRecord::new("Light", SimulatedLight::CLASS, Role::LIGHT)
                .with_init(json!({ "fail": "interlock open" }))
                .affecting("Camera"),
            ComponentRecord::new("Camera", SimulatedCamera::CLASS, Role::CCD),
        ];
        let orch = orchestrator(records, DriverCatalog::with_simulated());
        let report = orch.initialize().await.unwrap();

        assert_eq!(report.live, vec!["Camera".to_string()]);
        assert_eq!(
            report.warnings,
            vec![InitWarning::DegradedDependency {
                component: "Camera".into(),
                dependency: "Light".into()
            }]
        );
    }

    #[tokio::test]
    async fn test_retry_policy() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let mut catalog = DriverCatalog::with_simulated();
        catalog.register_factory(
            "flaky",
            builder(move |record: &ComponentRecord| {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(DriverError::new("first attempt times out"))
                } else {
                    SimulatedStage::from_record(record)
                }
            }),
        );

        let graph = Arc::new(ComponentGraph::build(vec![ComponentRecord::new("S", "flaky", Role::STAGE)]).unwrap());
        let config = EngineConfig {
            retry: RetryPolicy {
                max_attempts: 2,
                backoff_ms: 1,
            },
            ..EngineConfig::default()
        };
        let orch = Orchestrator::new(graph, Arc::new(catalog), Arc::new(RoleRegistry::new()), config);
        let report = orch.initialize().await.unwrap();
        assert_eq!(report.live, vec!["S".to_string()]);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_property_failure_fails_component() {
        let records = vec![stage("S").with_property("colour", json!("blue"))];
        let orch = orchestrator(records, DriverCatalog::with_simulated());
        let report = orch.initialize().await.unwrap();
        assert!(matches!(
            report.failure_of("S"),
            Some(ModelError::Driver { .. })
        ));
        assert!(orch.registry.lookup_by_name("S").is_err());
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let orch = orchestrator(vec![stage("A"), stage("B")], DriverCatalog::with_simulated());
        orch.cancel_handle().cancel();
        let report = orch.initialize().await.unwrap();
        assert!(report.live.is_empty());
        assert_eq!(report.cancelled, vec!["A".to_string(), "B".to_string()]);
        assert_eq!(orch.state("A"), Some(ComponentState::Declared));

        orch.cancel_handle().reset();
        let report = orch.initialize().await.unwrap();
        assert_eq!(report.live.len(), 2);
    }

    #[tokio::test]
    async fn test_second_initialize_requires_shutdown() {
        let orch = orchestrator(vec![stage("A")], DriverCatalog::with_simulated());
        orch.initialize().await.unwrap();
        assert_eq!(orch.initialize().await.err(), Some(ModelError::AlreadyRunning));

        let report = orch.shutdown().await;
        assert!(report.is_clean());
        assert_eq!(orch.state("A"), Some(ComponentState::Shutdown));
        assert!(orch.initialize().await.is_ok());
    }

    #[tokio::test]
    async fn test_mark_failed_takes_component_out() {
        let orch = orchestrator(vec![stage("A"), stage("B")], DriverCatalog::with_simulated());
        orch.initialize().await.unwrap();
        let cause = ModelError::driver("A", DriverError::new("encoder lost"));
        orch.mark_failed("A", &cause).await.unwrap();

        assert_eq!(orch.state("A"), Some(ComponentState::Failed));
        assert!(orch.registry.lookup_by_name("A").is_err());
        let report = orch.shutdown().await;
        assert_eq!(report.stopped, vec!["B".to_string()]);
    }

    /// Driver whose property setter panics.
    struct Brittle;

    #[async_trait]
    impl Driver for Brittle {
        async fn apply_property(&self, _name: &str, _value: &Value) -> Result<(), DriverError> {
            panic!("register map corrupted");
        }

        async fn shutdown(&self) -> Result<(), DriverError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_panicking_task_fails_component_and_parent() {
        let mut catalog = DriverCatalog::with_simulated();
        catalog.register_factory("brittle", builder(|_: &ComponentRecord| Ok(Brittle)));
        let records = vec![
            ComponentRecord::new("P", "brittle", Role::STAGE).with_property("gain", json!(2)),
            ComponentRecord::new("Align", MULTIPLEX_CLASS, Role::ALIGN).with_child("p", "P"),
            ComponentRecord::new("Lamp", SimulatedLight::CLASS, Role::LIGHT).affecting("P"),
        ];
        let orch = orchestrator(records, catalog);
        let report = orch.initialize().await.unwrap();

        assert_eq!(report.live, vec!["Lamp".to_string()]);
        assert!(report.cancelled.is_empty());
        match report.failure_of("P") {
            Some(ModelError::Driver { component, source }) => {
                assert_eq!(component, "P");
                assert!(source.message().contains("register map corrupted"));
            }
            other => panic!("unexpected cause: {other:?}"),
        }
        assert_eq!(
            report.failure_of("Align"),
            Some(&ModelError::DependencyFailed {
                component: "Align".into(),
                dependency: "P".into()
            })
        );
        assert_eq!(orch.state("P"), Some(ComponentState::Failed));
        assert_eq!(orch.state("Align"), Some(ComponentState::Failed));
        assert_eq!(
            report.warnings,
            vec![InitWarning::DegradedDependency {
                component: "Lamp".into(),
                dependency: "P".into()
            }]
        );
    }

    #[tokio::test]
    async fn test_live_proxies_keep_their_kind() {
        let records = vec![
            stage("A"),
            ComponentRecord::new("Align", MULTIPLEX_CLASS, Role::ALIGN).with_child("x", "A"),
        ];
        let orch = orchestrator(records, DriverCatalog::with_simulated());
        orch.initialize().await.unwrap();
        assert_eq!(orch.registry.lookup_by_name("A").unwrap().kind(), ProxyKind::Leaf);
        assert_eq!(
            orch.registry.lookup_by_name("Align").unwrap().kind(),
            ProxyKind::Composite
        );
        orch.shutdown().await;
    }

    #[tokio::test]
    #[traced_test]
    async fn test_failures_are_logged() {
        let orch = orchestrator(
            vec![stage("A").with_init(json!({ "fail": "no controller" }))],
            DriverCatalog::with_simulated(),
        );
        orch.initialize().await.unwrap();
        assert!(logs_contain("initialization failed"));
        assert!(logs_contain("no controller"));
    }
}
