//! Errors - エラーの運用分類

use serde::{Deserialize, Serialize};

/// ErrorKind は実行エラーの分類
///
/// - Transient: 一時的なエラー（retry budget を消費してリトライ）
/// - Permanent: 恒久的なエラー（リトライ無意味、即 dead-letter）
/// - Infrastructure: broker / datastore の障害（呼び出し側で backoff）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Transient,
    Permanent,
    Infrastructure,
}

impl ErrorKind {
    pub fn is_retryable(self) -> bool {
        !matches!(self, Self::Permanent)
    }
}
