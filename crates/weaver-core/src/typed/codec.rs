//! PayloadCodec - JSON payload と Task の相互変換
//!
//! decode 失敗は payload の形が違うということなので、リトライしても直らない。
//! WeaverError へは Validation として変換する（即 dead-letter）。

use thiserror::Error;

use super::task::Task;
use crate::error::WeaverError;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("payload does not match `{handler}`: {source}")]
    Decode {
        handler: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("cannot encode `{handler}` payload: {source}")]
    Encode {
        handler: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

impl From<CodecError> for WeaverError {
    fn from(err: CodecError) -> Self {
        WeaverError::Validation(err.to_string())
    }
}

pub struct PayloadCodec;

impl PayloadCodec {
    pub fn encode<T: Task>(task: &T) -> Result<serde_json::Value, CodecError> {
        serde_json::to_value(task).map_err(|source| CodecError::Encode {
            handler: T::TYPE,
            source,
        })
    }

    pub fn decode<T: Task>(payload: serde_json::Value) -> Result<T, CodecError> {
        serde_json::from_value(payload).map_err(|source| CodecError::Decode {
            handler: T::TYPE,
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde::{Deserialize, Serialize};
    use serde_json::json;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct LogClick {
        original_url: String,
    }

    impl Task for LogClick {
        const TYPE: &'static str = "urlshortener.log_click";
    }

    #[test]
    fn decode_mismatch_is_a_validation_error() {
        let err = PayloadCodec::decode::<LogClick>(json!({"url": 1})).unwrap_err();
        assert_matches!(err, CodecError::Decode { handler: "urlshortener.log_click", .. });

        let err: WeaverError = err.into();
        assert!(err.is_permanent());
    }

    #[test]
    fn encode_produces_plain_json() {
        let task = LogClick {
            original_url: "https://example.com".into(),
        };
        let value = PayloadCodec::encode(&task).unwrap();
        assert_eq!(value, json!({"original_url": "https://example.com"}));
        assert_eq!(PayloadCodec::decode::<LogClick>(value).unwrap(), task);
    }
}
