//! Engine scheduler pass.
//!
//! Each pass:
//! - Skips entirely while the status store or archive is not ready
//! - Reads the queued runs, dropping local and interrupted ones
//! - Counts this engine label's active pods
//! - Launches pods for the oldest queued runs until `max_engines` is reached
//!
//! A run is allocated to this controller (a compare-and-swap from `queued`
//! to `allocated`) before its pod is created, so two controllers never launch
//! the same run. Pod creation conflicts are retried with the same definition,
//! two seconds apart, up to the configured ceiling, after which the run is
//! finished as an environment failure.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use enginectl_reconcile::{Clock, LaunchThrottle, RetryBudget, POD_CONFLICT_RETRY_DELAY};
use enginectl_runs::{results, Run, RunRegistry};
use tracing::{debug, error, info, instrument, warn};

use crate::calls::registry_call;
use crate::facade::EngineFacade;
use crate::pod_template::PodTemplate;
use crate::settings::{Settings, SharedSettings};

/// Outcome of a scheduler pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SchedulerStats {
    /// False if the pass was skipped because dependencies were not ready.
    pub dependencies_ready: bool,
    pub queued: usize,
    pub active_before: usize,
    pub launched: usize,
    /// Runs another controller allocated first.
    pub lost_allocation: usize,
    /// Runs finished as environment failures after exhausting retries.
    pub gave_up: usize,
    /// Runs whose pod creation failed for another reason and were requeued.
    pub failed: usize,
}

enum LaunchOutcome {
    Launched,
    NotAllocated,
    GaveUp,
    Failed,
}

/// Launches engine pods for queued runs.
pub struct EngineScheduler {
    facade: EngineFacade,
    registry: Arc<dyn RunRegistry>,
    settings: SharedSettings,
    template: PodTemplate,
    clock: Arc<dyn Clock>,
    controller_name: String,
    call_timeout: Duration,
    throttle: LaunchThrottle,
}

impl EngineScheduler {
    pub fn new(
        facade: EngineFacade,
        registry: Arc<dyn RunRegistry>,
        settings: SharedSettings,
        template: PodTemplate,
        clock: Arc<dyn Clock>,
        controller_name: impl Into<String>,
        call_timeout: Duration,
    ) -> Self {
        let throttle = LaunchThrottle::new(settings.current().launch_interval);
        Self {
            facade,
            registry,
            settings,
            template,
            clock,
            controller_name: controller_name.into(),
            call_timeout,
            throttle,
        }
    }

    /// Run a single scheduling pass.
    #[instrument(skip(self))]
    pub async fn schedule(&mut self) -> Result<SchedulerStats> {
        let mut stats = SchedulerStats::default();

        if !self.facade.dependencies_ready().await {
            warn!("Status store or archive not ready, not scheduling new runs");
            return Ok(stats);
        }
        stats.dependencies_ready = true;

        let settings = self.settings.current();
        if self.throttle.interval() != settings.launch_interval {
            info!(
                from_ms = self.throttle.interval().as_millis() as u64,
                to_ms = settings.launch_interval.as_millis() as u64,
                "Launch interval changed"
            );
            self.throttle.set_interval(settings.launch_interval);
        }

        let mut queued: Vec<Run> = registry_call(self.call_timeout, self.registry.get_queued_runs())
            .await
            .context("failed to list queued runs")?
            .into_iter()
            .filter(Run::is_schedulable)
            .collect();
        queued.sort_by(|a, b| {
            (a.queued_at.is_none(), a.queued_at, &a.name).cmp(&(
                b.queued_at.is_none(),
                b.queued_at,
                &b.name,
            ))
        });
        stats.queued = queued.len();
        if queued.is_empty() {
            debug!("No queued runs");
            return Ok(stats);
        }

        let pods = self
            .facade
            .pods_for_engine(&settings.engine_label)
            .await
            .context("failed to list engine pods")?;
        let mut active = EngineFacade::active_pods(&pods).len();
        stats.active_before = active;
        info!(
            active,
            max_engines = settings.max_engines,
            queued = stats.queued,
            "Looking for runs to launch"
        );

        for run in &queued {
            if active >= settings.max_engines as usize {
                info!(
                    max_engines = settings.max_engines,
                    "At maximum engines, not launching more runs"
                );
                break;
            }

            self.throttle.ready(self.clock.as_ref()).await;
            let outcome = self.launch(run, &settings).await;
            match outcome {
                LaunchOutcome::Launched => {
                    self.throttle.record_launch(self.clock.now());
                    active += 1;
                    stats.launched += 1;
                }
                LaunchOutcome::NotAllocated => stats.lost_allocation += 1,
                LaunchOutcome::GaveUp => {
                    self.throttle.record_launch(self.clock.now());
                    stats.gave_up += 1;
                }
                LaunchOutcome::Failed => {
                    self.throttle.record_launch(self.clock.now());
                    stats.failed += 1;
                }
            }
        }

        info!(
            launched = stats.launched,
            lost_allocation = stats.lost_allocation,
            gave_up = stats.gave_up,
            failed = stats.failed,
            "Scheduling pass complete"
        );
        Ok(stats)
    }

    async fn launch(&self, run: &Run, settings: &Settings) -> LaunchOutcome {
        let run_name = run.name.as_str();

        match registry_call(
            self.call_timeout,
            self.registry.try_allocate(run_name, &self.controller_name),
        )
        .await
        {
            Ok(true) => {}
            Ok(false) => {
                info!(run_name = %run_name, "Run allocated by another controller");
                return LaunchOutcome::NotAllocated;
            }
            Err(e) => {
                warn!(run_name = %run_name, error = %e, "Failed to allocate run");
                return LaunchOutcome::NotAllocated;
            }
        }

        let pod = self.template.build(settings, run_name, run.trace);
        let pod_name = pod.metadata.name.clone().unwrap_or_default();
        let mut budget = RetryBudget::new(settings.max_pod_retries);

        while budget.try_acquire() {
            match self.facade.create_pod(&pod).await {
                Ok(_) => {
                    info!(run_name = %run_name, pod_name = %pod_name, "Engine pod started");
                    return LaunchOutcome::Launched;
                }
                Err(e) if e.is_conflict() => {
                    warn!(
                        run_name = %run_name,
                        pod_name = %pod_name,
                        attempt = budget.attempts(),
                        error = %e,
                        "Engine pod creation conflicted"
                    );
                    if !budget.is_exhausted() {
                        self.clock.sleep(POD_CONFLICT_RETRY_DELAY).await;
                    }
                }
                Err(e) => {
                    warn!(
                        run_name = %run_name,
                        pod_name = %pod_name,
                        error = %e,
                        "Failed to create engine pod, returning run to the queue"
                    );
                    if let Err(e) =
                        registry_call(self.call_timeout, self.registry.mark_queued(run_name)).await
                    {
                        error!(run_name = %run_name, error = %e, "Failed to requeue run");
                    }
                    return LaunchOutcome::Failed;
                }
            }
        }

        error!(
            run_name = %run_name,
            pod_name = %pod_name,
            attempts = budget.attempts(),
            "Engine pod could not be started, giving up"
        );
        if let Err(e) = registry_call(
            self.call_timeout,
            self.registry.mark_finished(run_name, results::ENV_FAIL),
        )
        .await
        {
            error!(run_name = %run_name, error = %e, "Failed to mark run as an environment failure");
        }
        LaunchOutcome::GaveUp
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{ClusterError, EnginePod, MockCluster, PodPhase, ENGINE_LABEL_KEY};
    use chrono::{TimeDelta, Utc};
    use enginectl_reconcile::ManualClock;
    use enginectl_runs::memory::InMemoryRunRegistry;
    use enginectl_runs::RunStatus;

    const NS: &str = "engines";
    const INSTALL: &str = "inst";
    const LABEL: &str = "k8s-standard-engine";

    struct Fixture {
        cluster: Arc<MockCluster>,
        registry: Arc<InMemoryRunRegistry>,
        clock: Arc<ManualClock>,
        scheduler: EngineScheduler,
    }

    async fn fixture(settings: Settings) -> Fixture {
        let cluster = Arc::new(MockCluster::new());
        cluster.add_ready_dependencies(NS, INSTALL).await;
        let registry = Arc::new(InMemoryRunRegistry::new());
        let clock = Arc::new(ManualClock::default());
        let facade = EngineFacade::new(cluster.clone(), NS, INSTALL, Duration::from_secs(5));
        let scheduler = EngineScheduler::new(
            facade,
            registry.clone(),
            SharedSettings::new(settings),
            PodTemplate::default(),
            clock.clone(),
            "controller-0",
            Duration::from_secs(5),
        );
        Fixture {
            cluster,
            registry,
            clock,
            scheduler,
        }
    }

    fn settings(max_engines: u32) -> Settings {
        Settings {
            max_engines,
            ..Settings::default()
        }
    }

    async fn engine_pods(cluster: &MockCluster) -> Vec<String> {
        cluster
            .pods(NS)
            .await
            .into_iter()
            .filter(|p| p.engine_label() == Some(LABEL))
            .map(|p| p.name)
            .collect()
    }

    #[tokio::test]
    async fn test_launches_oldest_first_up_to_max() {
        let mut f = fixture(settings(2)).await;
        let now = Utc::now();
        for (name, age) in [("U3", 10), ("U1", 30), ("U2", 20)] {
            f.registry
                .insert(
                    Run::new(name, RunStatus::Queued).with_queued_at(now - TimeDelta::seconds(age)),
                )
                .await;
        }

        let stats = f.scheduler.schedule().await.unwrap();
        assert_eq!(stats.launched, 2);
        assert_eq!(
            engine_pods(&f.cluster).await,
            vec!["k8s-standard-engine-u1", "k8s-standard-engine-u2"]
        );

        let u1 = f.registry.get_run("U1").await.unwrap().unwrap();
        assert_eq!(u1.status, RunStatus::Allocated);
        assert_eq!(u1.controller.as_deref(), Some("controller-0"));
        assert_eq!(
            f.registry.get_run("U3").await.unwrap().unwrap().status,
            RunStatus::Queued
        );
    }

    #[tokio::test]
    async fn test_existing_active_pods_count_toward_max() {
        let mut f = fixture(settings(2)).await;
        f.cluster
            .add_pod(
                NS,
                EnginePod::new("running")
                    .with_label(ENGINE_LABEL_KEY, LABEL)
                    .with_phase(PodPhase::Running),
            )
            .await;
        f.cluster
            .add_pod(
                NS,
                EnginePod::new("done")
                    .with_label(ENGINE_LABEL_KEY, LABEL)
                    .with_phase(PodPhase::Succeeded),
            )
            .await;
        f.registry.insert(Run::new("U1", RunStatus::Queued)).await;
        f.registry.insert(Run::new("U2", RunStatus::Queued)).await;

        let stats = f.scheduler.schedule().await.unwrap();
        assert_eq!(stats.active_before, 1);
        assert_eq!(stats.launched, 1);
    }

    #[tokio::test]
    async fn test_skips_local_and_interrupted_runs() {
        let mut f = fixture(settings(5)).await;
        f.registry
            .insert(Run::new("U1", RunStatus::Queued).local())
            .await;
        f.registry
            .insert(Run::new("U2", RunStatus::Queued).with_interrupt("cancelled", None))
            .await;

        let stats = f.scheduler.schedule().await.unwrap();
        assert_eq!(stats.queued, 0);
        assert!(engine_pods(&f.cluster).await.is_empty());
    }

    #[tokio::test]
    async fn test_no_launch_when_dependencies_not_ready() {
        let mut f = fixture(settings(5)).await;
        f.cluster.fail_list_selector("app=inst-etcd").await;
        f.registry.insert(Run::new("U1", RunStatus::Queued)).await;

        let stats = f.scheduler.schedule().await.unwrap();
        assert!(!stats.dependencies_ready);
        assert_eq!(f.cluster.create_attempts(), 0);
    }

    #[tokio::test]
    async fn test_conflicts_retried_then_succeed() {
        let mut f = fixture(Settings {
            max_pod_retries: 3,
            ..settings(1)
        })
        .await;
        f.cluster.inject_conflicts(2);
        f.registry.insert(Run::new("U1", RunStatus::Queued)).await;

        let stats = f.scheduler.schedule().await.unwrap();
        assert_eq!(stats.launched, 1);
        assert_eq!(f.cluster.create_attempts(), 3);
        assert_eq!(f.clock.sleeps(), vec![POD_CONFLICT_RETRY_DELAY; 2]);
    }

    #[tokio::test]
    async fn test_retry_ceiling_marks_run_env_fail() {
        let mut f = fixture(Settings {
            max_pod_retries: 2,
            ..settings(1)
        })
        .await;
        f.cluster.inject_conflicts(100);
        f.registry.insert(Run::new("U1", RunStatus::Queued)).await;

        let stats = f.scheduler.schedule().await.unwrap();
        assert_eq!(stats.gave_up, 1);
        assert_eq!(f.cluster.create_attempts(), 3);
        assert_eq!(f.clock.sleeps(), vec![POD_CONFLICT_RETRY_DELAY; 2]);

        let run = f.registry.get_run("U1").await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Finished);
        assert_eq!(run.result.as_deref(), Some(results::ENV_FAIL));
    }

    #[tokio::test]
    async fn test_other_create_errors_requeue_run() {
        let mut f = fixture(settings(1)).await;
        f.registry.insert(Run::new("U1", RunStatus::Queued)).await;
        f.scheduler.facade = EngineFacade::new(
            Arc::new(FailingCreates(f.cluster.clone())),
            NS,
            INSTALL,
            Duration::from_secs(5),
        );

        let stats = f.scheduler.schedule().await.unwrap();
        assert_eq!(stats.failed, 1);
        assert_eq!(
            f.registry.get_run("U1").await.unwrap().unwrap().status,
            RunStatus::Queued
        );
    }

    #[tokio::test]
    async fn test_launch_interval_between_launches() {
        let mut f = fixture(Settings {
            launch_interval: Duration::from_millis(750),
            ..settings(3)
        })
        .await;
        for name in ["U1", "U2", "U3"] {
            f.registry.insert(Run::new(name, RunStatus::Queued)).await;
        }

        f.scheduler.schedule().await.unwrap();
        assert_eq!(
            f.clock.sleeps(),
            vec![Duration::from_millis(750), Duration::from_millis(750)]
        );
    }

    #[tokio::test]
    async fn test_reloaded_launch_interval_applies_next_pass() {
        let mut f = fixture(Settings {
            launch_interval: Duration::from_millis(750),
            ..settings(2)
        })
        .await;
        f.registry.insert(Run::new("U1", RunStatus::Queued)).await;
        f.scheduler.schedule().await.unwrap();

        f.scheduler.settings.replace(Settings {
            launch_interval: Duration::from_millis(300),
            ..settings(2)
        });
        f.registry.insert(Run::new("U2", RunStatus::Queued)).await;
        f.scheduler.schedule().await.unwrap();

        assert_eq!(f.scheduler.throttle.interval(), Duration::from_millis(300));
        assert_eq!(f.clock.sleeps(), vec![Duration::from_millis(300)]);
    }

    struct FailingCreates(Arc<MockCluster>);

    #[async_trait::async_trait]
    impl crate::cluster::ClusterClient for FailingCreates {
        async fn list_pods(
            &self,
            namespace: &str,
            selector: &str,
        ) -> Result<Vec<EnginePod>, ClusterError> {
            self.0.list_pods(namespace, selector).await
        }

        async fn create_pod(
            &self,
            _: &str,
            _: &k8s_openapi::api::core::v1::Pod,
        ) -> Result<EnginePod, ClusterError> {
            Err(ClusterError::Api {
                code: 500,
                message: "internal error".to_string(),
            })
        }

        async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), ClusterError> {
            self.0.delete_pod(namespace, name).await
        }

        async fn read_config_map(
            &self,
            namespace: &str,
            name: &str,
        ) -> Result<crate::cluster::ConfigMapData, ClusterError> {
            self.0.read_config_map(namespace, name).await
        }
    }
}
