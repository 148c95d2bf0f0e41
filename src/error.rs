use thiserror::Error;

/// SIP エンジンの処理エラー。ワイヤ上のステータスコードへの対応は
/// エンジン側（`sip::core`）で行う。
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("validation failed: {0:?}")]
    Validation(Vec<String>),

    #[error("extension {0} is not registered")]
    Unregistered(String),

    #[error("extension {0} is busy")]
    Busy(String),

    #[error("no dialog for Call-ID {0}")]
    UnknownDialog(String),

    #[error("internal error: {0}")]
    Internal(String),
}
