//! # evstream-mux
//!
//! 1 本の接続上で論理ストリームを多重化する。
//!
//! ## 内部アーキテクチャ
//!
//! ```text
//! Multiplexer
//!   ├── Transport (弱参照)  - 名前付きイベントの送受信。所有者はアプリ
//!   ├── Encoder / Decoder   - イベント引数とワイヤ値の変換
//!   ├── streams             - ID → IoStream のレジストリ（この多重化器だけが触る）
//!   └── listeners           - イベント名 → リスナー
//! ```
//!
//! ## トランスポート上のイベント
//!
//! ```text
//! $stream       (event, ...args) [+ ack]   アプリケーションイベント
//! $stream-read  (id, size)                 読み取り要求
//! $stream-write (id, chunk, encoding) + ack
//! $stream-end   (id)
//! $stream-error (id, message)
//! disconnect / error                       トランスポート自身の通知
//! ```
//!
//! ## スレッド安全性
//!
//! シングルスレッド前提（`Rc` / `RefCell`）。ハンドラもリスナーも同じイベントループで動く。

pub mod error;
pub mod event;
pub mod multiplexer;
pub mod options;
pub mod reply;
pub mod transport;

pub use error::{MuxError, Result};
pub use event::{EventKind, ReservedEvent};
pub use multiplexer::Multiplexer;
pub use options::MultiplexerOptions;
pub use reply::Reply;
pub use transport::{Ack, Handler, Transport};
