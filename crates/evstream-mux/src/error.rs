//! evstream-mux エラー型

use evstream_codec::CodecError;
use thiserror::Error;

/// 多重化器の操作エラー
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MuxError {
    /// ストリームは一度しか送れない（バインド済み・破棄済み）
    #[error("stream has already been sent")]
    AlreadySent,
    /// 送信しようとしたストリームの ID が既にレジストリにある
    #[error("Encoded stream already exists: {0}")]
    DuplicateId(String),
    /// 引数の符号化・復号に失敗
    #[error(transparent)]
    Codec(#[from] CodecError),
    /// トランスポートが既に破棄されている
    #[error("transport has been dropped")]
    TransportGone,
    /// 多重化器が既に破棄されている
    #[error("multiplexer has been dropped")]
    MultiplexerGone,
    /// 同じ問い合わせに二度返信しようとした
    #[error("reply has already been sent")]
    AlreadyReplied,
    /// 予約イベントは相手に届かないので応答も来ない
    #[error("reserved event cannot be acknowledged: {0}")]
    ReservedEvent(String),
}

pub type Result<T> = core::result::Result<T, MuxError>;
