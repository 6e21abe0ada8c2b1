//! evstream-wire エラー型

use thiserror::Error;

/// ワイヤ値の変換エラー
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    /// base64 として宣言されたチャンクがデコードできない
    #[error("invalid base64 chunk: {0}")]
    InvalidBase64(String),
    /// バイト列に変換できない形のチャンク
    #[error("chunk is not convertible to bytes: {0}")]
    InvalidChunk(&'static str),
}
