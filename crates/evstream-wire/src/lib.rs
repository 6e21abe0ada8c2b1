//! # evstream-wire
//!
//! トランスポート上を流れる値の表現。
//!
//! アプリケーションが送る引数は、ストリームを含まない「ワイヤ安全」な値に
//! 変換されてからトランスポートに渡る。ストリームはプレースホルダに置き換わる。
//!
//! ## プレースホルダの JSON 形式
//!
//! ```text
//! { "$stream": "<stream id>", "options": { "highWaterMark": 10, "objectMode": false, "allowHalfOpen": false } }
//!   ↑ 予約マーカー                ↑ 設定されている場合のみ
//! ```
//!
//! ## 制御メッセージ
//!
//! ```text
//! $stream-read  (id, size)
//! $stream-write (id, chunk, encoding) + ack
//! $stream-end   (id)
//! $stream-error (id, message)
//! ```

pub mod chunk;
pub mod error;
pub mod options;
pub mod value;

pub use chunk::{Chunk, Encoding};
pub use error::WireError;
pub use options::StreamOptions;
pub use value::{Placeholder, WireValue};

/// プレースホルダを通常のオブジェクトと区別する予約フィールド名
pub const STREAM_MARKER: &str = "$stream";

/// アプリケーションイベントを運ぶベースイベント名
pub const BASE_EVENT: &str = "$stream";

/// 読み取り要求（id, size）
pub const READ_EVENT: &str = "$stream-read";

/// チャンク送信（id, chunk, encoding）+ 完了 ack
pub const WRITE_EVENT: &str = "$stream-write";

/// 送信側の終了通知（id）
pub const END_EVENT: &str = "$stream-end";

/// 障害通知（id, message）
pub const ERROR_EVENT: &str = "$stream-error";

/// トランスポートが接続断を通知するイベント名
pub const DISCONNECT_EVENT: &str = "disconnect";

/// トランスポートが自身のエラーを通知するイベント名
pub const TRANSPORT_ERROR_EVENT: &str = "error";
