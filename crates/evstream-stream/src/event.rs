//! ストリームが発火するイベント

use evstream_wire::Chunk;

use crate::error::StreamError;

/// ストリームのイベント
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// 読み取りバッファにデータが入った（一時停止モード）
    Readable,
    /// チャンクを受信した（フローモード）
    Data(Chunk),
    /// 読み取り側が終わった（これ以上チャンクは来ない）
    End,
    /// 書き込み側がすべて送り終えて `end` を送った
    Finish,
    /// 書き込みキューが閾値を下回った
    Drain,
    /// ストリームが閉じた
    Close,
    /// 障害
    Error(StreamError),
}
