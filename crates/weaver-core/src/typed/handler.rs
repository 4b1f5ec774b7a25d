//! Handler trait - Task を実行する Handler の定義
//!
//! # 学習ポイント
//! - ジェネリック trait (Handler<T>)
//! - Object-safe trait (DynHandler)
//! - Type erasure パターン (TypedHandler<T, H> → DynHandler)
//!
//! handler は冪等であること。at-least-once 配送なので同じ job が
//! 2 回以上届くことがある。

use std::future::Future;
use std::marker::PhantomData;

use async_trait::async_trait;

use super::codec::PayloadCodec;
use super::task::Task;
use crate::domain::{HandlerId, JobEnvelope, JobId, QueueName};
use crate::error::WeaverError;

/// Delivery metadata handed to a handler next to its payload.
#[derive(Debug, Clone, PartialEq)]
pub struct JobContext {
    pub job_id: JobId,
    pub queue: QueueName,
    pub handler: HandlerId,
    pub delivery_count: u32,
    pub max_retries: u32,
}

impl JobContext {
    pub fn from_envelope(envelope: &JobEnvelope) -> Self {
        Self {
            job_id: envelope.id,
            queue: envelope.queue.clone(),
            handler: envelope.handler.clone(),
            delivery_count: envelope.delivery_count,
            max_retries: envelope.max_retries,
        }
    }

    /// A failure now sends the job to the dead-letter sink.
    pub fn is_last_attempt(&self) -> bool {
        self.delivery_count >= self.max_retries
    }
}

/// Handler は Task を実行する
///
/// # 使用例
/// ```ignore
/// struct LogClickHandler;
///
/// #[async_trait]
/// impl Handler<LogClick> for LogClickHandler {
///     async fn handle(&self, task: LogClick, ctx: JobContext) -> Result<(), WeaverError> {
///         tracing::info!(job_id = %ctx.job_id, url = %task.original_url, "click");
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait Handler<T: Task>: Send + Sync {
    async fn handle(&self, task: T, ctx: JobContext) -> Result<(), WeaverError>;
}

/// DynHandler は object-safe な Handler の抽象化
///
/// HashMap<HandlerId, Arc<dyn DynHandler>> に格納するための型消去層。
#[async_trait]
pub trait DynHandler: Send + Sync {
    async fn handle_dyn(&self, payload: serde_json::Value, ctx: JobContext)
    -> Result<(), WeaverError>;

    fn handler_id(&self) -> &str;
}

pub struct TypedHandler<T: Task, H: Handler<T>> {
    handler: H,
    _marker: PhantomData<T>,
}

impl<T: Task, H: Handler<T>> TypedHandler<T, H> {
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<T: Task, H: Handler<T>> DynHandler for TypedHandler<T, H> {
    async fn handle_dyn(
        &self,
        payload: serde_json::Value,
        ctx: JobContext,
    ) -> Result<(), WeaverError> {
        let task: T = PayloadCodec::decode(payload)?;
        self.handler.handle(task, ctx).await
    }

    fn handler_id(&self) -> &str {
        T::TYPE
    }
}

/// Handler over the raw JSON payload, built from a closure.
pub struct FnHandler<F> {
    id: HandlerId,
    f: F,
}

impl<F, Fut> FnHandler<F>
where
    F: Fn(serde_json::Value, JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), WeaverError>> + Send + 'static,
{
    pub fn new(id: impl Into<HandlerId>, f: F) -> Self {
        Self { id: id.into(), f }
    }
}

#[async_trait]
impl<F, Fut> DynHandler for FnHandler<F>
where
    F: Fn(serde_json::Value, JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), WeaverError>> + Send + 'static,
{
    async fn handle_dyn(
        &self,
        payload: serde_json::Value,
        ctx: JobContext,
    ) -> Result<(), WeaverError> {
        (self.f)(payload, ctx).await
    }

    fn handler_id(&self) -> &str {
        self.id.as_str()
    }
}
