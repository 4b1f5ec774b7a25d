//! Task trait - 型付き Task の定義
//!
//! # 学習ポイント
//! - Associated Constants (`const TYPE`)
//! - Trait bounds の組み合わせ (Serialize + DeserializeOwned + Send + Sync + 'static)

use serde::Serialize;
use serde::de::DeserializeOwned;

/// Task は handler id と payload の型を対応付ける
///
/// # 使用例
/// ```ignore
/// #[derive(Serialize, Deserialize)]
/// struct LogClick {
///     original_url: String,
/// }
///
/// impl Task for LogClick {
///     const TYPE: &'static str = "urlshortener.log_click";
/// }
/// ```
///
/// # Trait Bounds
/// - `Serialize`: producer 側で JSON payload にするため
/// - `DeserializeOwned`: worker 側で payload から復元するため
/// - `Send + Sync + 'static`: Arc に格納してスロット間で共有するため
pub trait Task: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// handler id
    ///
    /// # 命名規約
    /// - `{namespace}.{action}`、必要なら `.v{major}` を付ける
    /// - 使える文字: 英数字と `_ . : -`
    const TYPE: &'static str;
}
