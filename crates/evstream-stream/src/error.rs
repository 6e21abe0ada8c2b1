//! evstream-stream エラー型

use thiserror::Error;

/// ストリームの障害
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StreamError {
    /// 相手側で発生し `error` 制御メッセージで届いた障害
    #[error("{0}")]
    Remote(String),
    /// こちら側で発生した障害（相手にはメッセージだけが送られる）
    #[error("{0}")]
    Local(String),
    /// 下位の接続が切れた
    #[error("Connection aborted")]
    ConnectionAborted,
    /// `end()` 後の書き込み
    #[error("write after end")]
    WriteAfterEnd,
    /// 破棄済みストリームへの操作
    #[error("stream destroyed")]
    Destroyed,
    /// バイトモードのストリームに要素を書こうとした
    #[error("object chunk written to a byte-mode stream")]
    ElementModeMismatch,
    /// 既にどこかの多重化器に送られた（またはバインドされた）ストリーム
    #[error("stream has already been sent")]
    AlreadySent,
}

impl StreamError {
    /// 相手側由来の障害か
    pub fn is_remote(&self) -> bool {
        matches!(self, StreamError::Remote(_))
    }
}
