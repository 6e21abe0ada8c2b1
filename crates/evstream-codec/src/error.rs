//! evstream-codec エラー型

use thiserror::Error;

/// 符号化・復号のエラー
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    /// ネストが深すぎる（循環した入力の可能性）
    #[error("value nested deeper than {limit} levels")]
    DepthExceeded { limit: usize },
}
