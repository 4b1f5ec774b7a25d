//! TypedRegistry - Handler の登録と管理
//!
//! 起動時に組み立て（mutable）、実行時は読み取り専用で全スロットから共有する。
//!
//! # 学習ポイント
//! - HashMap での型消去された trait object の管理
//! - Generic methods での登録と型安全性
//! - Arc による共有所有権

use std::collections::HashMap;
use std::sync::Arc;

use super::handler::{DynHandler, Handler, TypedHandler};
use super::task::Task;
use crate::domain::HandlerId;

/// TypedRegistry は handler id → DynHandler の対応表
///
/// # 使用例
/// ```ignore
/// let mut registry = TypedRegistry::new();
/// registry.register::<LogClick, _>(LogClickHandler)?;
///
/// let handler = registry.get(&HandlerId::new("urlshortener.log_click"));
/// ```
#[derive(Default)]
pub struct TypedRegistry {
    handlers: HashMap<HandlerId, Arc<dyn DynHandler>>,
}

/// RegistryError は TypedRegistry の操作エラー
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Handler for '{0}' is already registered")]
    AlreadyRegistered(String),

    #[error("Invalid handler id '{id}': {reason}")]
    InvalidHandlerId { id: String, reason: String },
}

impl TypedRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    pub fn register<T: Task, H: Handler<T> + 'static>(
        &mut self,
        handler: H,
    ) -> Result<(), RegistryError> {
        self.register_dyn(Arc::new(TypedHandler::new(handler)))
    }

    /// Registers an already type-erased handler (e.g. `FnHandler`).
    pub fn register_dyn(&mut self, handler: Arc<dyn DynHandler>) -> Result<(), RegistryError> {
        let id = HandlerId::new(handler.handler_id());
        id.validate()
            .map_err(|e| RegistryError::InvalidHandlerId {
                id: id.to_string(),
                reason: e.to_string(),
            })?;
        if self.handlers.contains_key(&id) {
            return Err(RegistryError::AlreadyRegistered(id.to_string()));
        }
        self.handlers.insert(id, handler);
        Ok(())
    }

    pub fn get(&self, id: &HandlerId) -> Option<Arc<dyn DynHandler>> {
        self.handlers.get(id).cloned()
    }

    /// Sorted, for stable logs and error messages.
    pub fn registered_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.keys().map(|id| id.to_string()).collect();
        types.sort();
        types
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
