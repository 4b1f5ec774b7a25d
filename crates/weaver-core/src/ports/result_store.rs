//! ResultStore port - 実行結果の正本
//!
//! terminal attempt ごとに 1 行。(job_id, generation) で insert-if-absent にすることで
//! 重複配送があっても結果は 1 つに保たれる。dead letter を replay すると generation が
//! 進むので、replay 後の実行も自分の結果を残せる。

use async_trait::async_trait;

use crate::domain::{ExecutionResult, JobId};
use crate::error::WeaverError;

#[async_trait]
pub trait ResultStore: Send + Sync {
    /// Returns `false` when a result for this job and generation already existed
    /// (nothing written).
    async fn record_result(&self, result: &ExecutionResult) -> Result<bool, WeaverError>;

    /// Result of the latest generation.
    async fn result_for(&self, job_id: JobId) -> Result<Option<ExecutionResult>, WeaverError>;
}
