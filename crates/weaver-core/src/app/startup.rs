//! Startup - readiness を待ってから起動する
//!
//! プロセスが「起動した」ことと「使える」ことは別。
//! 各ロールは依存先の health probe が ready を返すまで待ち、
//! timeout を過ぎたら DependencyNotReady で諦める（CLI は非ゼロ終了）。
//!
//! | role      | gates                                   |
//! |-----------|-----------------------------------------|
//! | Migrator  | datastore live                          |
//! | Producer  | datastore ready                         |
//! | Worker    | broker reachable → datastore ready      |
//! | Scheduler | datastore ready → broker reachable      |

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::WeaverError;
use crate::ports::{Broker, HealthProbe};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadinessPolicy {
    /// Pause between probes.
    pub interval: Duration,

    /// Give up after this long.
    pub timeout: Duration,
}

impl Default for ReadinessPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            timeout: Duration::from_secs(60),
        }
    }
}

impl ReadinessPolicy {
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Something a process waits for before starting its main loop.
#[async_trait]
pub trait Dependency: Send + Sync {
    fn name(&self) -> &str;

    /// `Err(reason)` while not usable yet.
    async fn check(&self) -> Result<(), String>;
}

/// The broker answers `ping`.
pub struct BrokerReachable(pub Arc<dyn Broker>);

#[async_trait]
impl Dependency for BrokerReachable {
    fn name(&self) -> &str {
        "broker"
    }

    async fn check(&self) -> Result<(), String> {
        self.0.ping().await.map_err(|e| e.to_string())
    }
}

/// The datastore accepts connections (schema may still be migrating).
pub struct DatastoreLive(pub Arc<dyn HealthProbe>);

#[async_trait]
impl Dependency for DatastoreLive {
    fn name(&self) -> &str {
        "datastore (live)"
    }

    async fn check(&self) -> Result<(), String> {
        match self.0.liveness().await {
            state if state.is_ready() => Ok(()),
            state => Err(state.to_string()),
        }
    }
}

/// The datastore is reachable and fully migrated.
pub struct DatastoreReady(pub Arc<dyn HealthProbe>);

#[async_trait]
impl Dependency for DatastoreReady {
    fn name(&self) -> &str {
        "datastore"
    }

    async fn check(&self) -> Result<(), String> {
        match self.0.readiness().await {
            state if state.is_ready() => Ok(()),
            state => Err(state.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StartupCoordinator {
    policy: ReadinessPolicy,
}

impl StartupCoordinator {
    pub fn new(policy: ReadinessPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> ReadinessPolicy {
        self.policy
    }

    /// Polls `dependency` until it reports ready. Returns how long it took.
    pub async fn wait_ready(&self, dependency: &dyn Dependency) -> Result<Duration, WeaverError> {
        let started = Instant::now();
        let deadline = started + self.policy.timeout;
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            // probe 自体が固まっても deadline は守る
            let reason = match tokio::time::timeout_at(deadline, dependency.check()).await {
                Ok(Ok(())) => {
                    let waited = started.elapsed();
                    info!(
                        dependency = dependency.name(),
                        waited_ms = waited.as_millis() as u64,
                        attempt,
                        "dependency ready"
                    );
                    return Ok(waited);
                }
                Ok(Err(reason)) => reason,
                Err(_) => "probe did not answer before the deadline".to_string(),
            };

            let now = Instant::now();
            if now >= deadline || now + self.policy.interval > deadline {
                warn!(dependency = dependency.name(), reason = %reason, "dependency not ready, giving up");
                return Err(WeaverError::DependencyNotReady {
                    dependency: dependency.name().to_string(),
                    waited: now - started,
                    reason,
                });
            }
            debug!(dependency = dependency.name(), reason = %reason, attempt, "waiting for dependency");
            tokio::time::sleep(self.policy.interval).await;
        }
    }

    /// Waits for each dependency in order. Each gets the full timeout.
    pub async fn wait_all(&self, dependencies: &[Arc<dyn Dependency>]) -> Result<(), WeaverError> {
        for dependency in dependencies {
            self.wait_ready(dependency.as_ref()).await?;
        }
        Ok(())
    }
}

/// Process roles of a deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Migrator,
    Producer,
    Worker,
    Scheduler,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Migrator => "migrator",
            Self::Producer => "producer",
            Self::Worker => "worker",
            Self::Scheduler => "scheduler",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered readiness gates of one role.
pub struct StartupPlan {
    role: Role,
    coordinator: StartupCoordinator,
    gates: Vec<Arc<dyn Dependency>>,
}

impl StartupPlan {
    pub fn for_role(
        role: Role,
        policy: ReadinessPolicy,
        broker: Arc<dyn Broker>,
        datastore: Arc<dyn HealthProbe>,
    ) -> Self {
        let broker: Arc<dyn Dependency> = Arc::new(BrokerReachable(broker));
        let gates: Vec<Arc<dyn Dependency>> = match role {
            Role::Migrator => vec![Arc::new(DatastoreLive(datastore))],
            Role::Producer => vec![Arc::new(DatastoreReady(datastore))],
            Role::Worker => vec![broker, Arc::new(DatastoreReady(datastore))],
            Role::Scheduler => vec![Arc::new(DatastoreReady(datastore)), broker],
        };
        Self {
            role,
            coordinator: StartupCoordinator::new(policy),
            gates,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn gate_names(&self) -> Vec<&str> {
        self.gates.iter().map(|g| g.name()).collect()
    }

    pub async fn wait(&self) -> Result<(), WeaverError> {
        info!(role = %self.role, gates = ?self.gate_names(), "waiting for dependencies");
        self.coordinator.wait_all(&self.gates).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::HealthState;
    use crate::impls::InMemoryDatastore;
    use crate::queue::InMemoryBroker;
    use assert_matches::assert_matches;
    use rstest::rstest;

    fn policy() -> ReadinessPolicy {
        ReadinessPolicy::default()
            .with_interval(Duration::from_secs(1))
            .with_timeout(Duration::from_secs(30))
    }

    #[rstest]
    #[case(Role::Migrator, vec!["datastore (live)"])]
    #[case(Role::Producer, vec!["datastore"])]
    #[case(Role::Worker, vec!["broker", "datastore"])]
    #[case(Role::Scheduler, vec!["datastore", "broker"])]
    fn gates_follow_role(#[case] role: Role, #[case] expected: Vec<&str>) {
        let plan = StartupPlan::for_role(
            role,
            policy(),
            Arc::new(InMemoryBroker::default()),
            Arc::new(InMemoryDatastore::new()),
        );
        assert_eq!(plan.gate_names(), expected);
    }

    #[tokio::test(start_paused = true)]
    async fn waits_until_probe_reports_ready() {
        let store = Arc::new(InMemoryDatastore::starting());
        let flip = Arc::clone(&store);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(10)).await;
            flip.set_readiness(HealthState::Ready);
        });

        let waited = StartupCoordinator::new(policy())
            .wait_ready(&DatastoreReady(store))
            .await
            .unwrap();
        assert!(waited >= Duration::from_secs(10));
        assert!(waited < Duration::from_secs(12));
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_with_last_reason() {
        let store = Arc::new(InMemoryDatastore::starting());
        let err = StartupCoordinator::new(policy())
            .wait_ready(&DatastoreReady(store))
            .await
            .unwrap_err();

        assert_matches!(
            err,
            WeaverError::DependencyNotReady { ref dependency, waited, ref reason }
                if dependency == "datastore"
                    && waited <= Duration::from_secs(30)
                    && reason.contains("migrations pending")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn migrator_only_needs_liveness() {
        let plan = StartupPlan::for_role(
            Role::Migrator,
            policy(),
            Arc::new(InMemoryBroker::default()),
            Arc::new(InMemoryDatastore::starting()),
        );
        plan.wait().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn worker_fails_fast_on_unreachable_broker() {
        let broker = Arc::new(InMemoryBroker::default());
        broker.set_available(false);
        let plan = StartupPlan::for_role(
            Role::Worker,
            policy(),
            broker,
            Arc::new(InMemoryDatastore::new()),
        );

        assert_matches!(
            plan.wait().await,
            Err(WeaverError::DependencyNotReady { ref dependency, .. }) if dependency == "broker"
        );
    }
}
