use async_trait::async_trait;

use crate::domain::HealthState;

/// Health endpoint of the datastore.
///
/// `liveness` only says the service accepts connections. `readiness` also
/// requires the schema to be fully migrated; dependents gate on it.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn liveness(&self) -> HealthState;

    async fn readiness(&self) -> HealthState;
}
