//! AppBuilder - handler 登録と起動時検証
//!
//! # 学習ポイント
//! - Builder パターンの実装
//! - 起動時検証（Fail-fast 設計）

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use super::runtime::Runtime;
use crate::domain::HandlerId;
use crate::error::WeaverError;
use crate::typed::{FnHandler, Handler, JobContext, RegistryError, Task, TypedRegistry};

/// AppBuilder は worker プロセスの handler 表を組み立てる
///
/// # 使用例
/// ```ignore
/// let app = AppBuilder::new()
///     .register::<LogClick, _>(LogClickHandler)?
///     .expect_tasks(&["urlshortener.log_click"])
///     .build()?;
/// let runtime = app.runtime();
/// ```
///
/// # Fail-fast 設計
/// - expect_tasks() で期待される handler id を登録
/// - build() 時に「期待集合 ⊆ 登録済み集合」をチェック
pub struct AppBuilder {
    registry: TypedRegistry,
    expected_tasks: Option<Vec<String>>,
    default_timeout: Option<Duration>,
}

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("Missing task types: {0:?}. These tasks were expected but not registered.")]
    MissingTaskTypes(Vec<String>),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl AppBuilder {
    pub fn new() -> Self {
        Self {
            registry: TypedRegistry::new(),
            expected_tasks: None,
            default_timeout: None,
        }
    }

    pub fn register<T: Task, H: Handler<T> + 'static>(
        mut self,
        handler: H,
    ) -> Result<Self, RegistryError> {
        self.registry.register::<T, H>(handler)?;
        Ok(self)
    }

    /// Registers a closure over the raw JSON payload.
    pub fn register_fn<F, Fut>(mut self, id: impl Into<HandlerId>, f: F) -> Result<Self, RegistryError>
    where
        F: Fn(serde_json::Value, JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), WeaverError>> + Send + 'static,
    {
        self.registry.register_dyn(Arc::new(FnHandler::new(id, f)))?;
        Ok(self)
    }

    pub fn expect_tasks(mut self, task_types: &[&str]) -> Self {
        self.expected_tasks = Some(task_types.iter().map(|t| t.to_string()).collect());
        self
    }

    /// Deadline for jobs that do not carry their own timeout.
    pub fn default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = Some(timeout);
        self
    }

    pub fn build(self) -> Result<App, BuildError> {
        if let Some(expected_tasks) = &self.expected_tasks {
            let registered_types = self.registry.registered_types();
            let missing_tasks: Vec<String> = expected_tasks
                .iter()
                .filter(|x| !registered_types.contains(x))
                .cloned()
                .collect();
            if !missing_tasks.is_empty() {
                return Err(BuildError::MissingTaskTypes(missing_tasks));
            }
        }
        Ok(App {
            registry: Arc::new(self.registry),
            default_timeout: self.default_timeout,
        })
    }
}

impl Default for AppBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Immutable handler table, shared read-only by every worker slot.
pub struct App {
    registry: Arc<TypedRegistry>,
    default_timeout: Option<Duration>,
}

impl std::fmt::Debug for App {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("App")
            .field("default_timeout", &self.default_timeout)
            .finish_non_exhaustive()
    }
}

impl App {
    pub fn registry(&self) -> &TypedRegistry {
        &self.registry
    }

    pub fn runtime(&self) -> Runtime {
        let runtime = Runtime::new(Arc::clone(&self.registry));
        match self.default_timeout {
            Some(timeout) => runtime.with_default_timeout(timeout),
            None => runtime,
        }
    }
}
