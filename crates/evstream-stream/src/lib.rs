//! # evstream-stream
//!
//! 多重化された論理ストリーム 1 本分の状態機械。
//!
//! ## 役割
//!
//! - 読み取り側: 消費者の要求（N 単位）を `read(id, N)` 制御メッセージとして相手に伝える。
//!   相手の書き込み側は、この要求を受けたときだけ次のチャンクを送る
//! - 書き込み側: 相手から `read` が届くまでチャンクを保持し、届いたら 1 つ送る。
//!   相手がチャンクを受け入れると ack が返り、次の書き込みに進む
//! - 終了・障害・破棄の伝播
//!
//! ## 状態遷移
//!
//! ```text
//! unbound ──attach──▶ bound ──┬─ end (両方向) ──▶ destroyed
//!                             ├─ error ─────────▶ destroyed
//!                             └─ destroy/接続断 ─▶ destroyed
//! ```
//!
//! ストリーム自身はレジストリに触れない。送信と後始末はすべて
//! [`StreamOwner`]（所属する多重化器）経由で行う。

pub mod error;
pub mod event;
pub mod owner;
pub mod stream;

pub use error::StreamError;
pub use event::StreamEvent;
pub use owner::{Accepted, StreamOwner, WriteDone};
pub use stream::{IoStream, StreamStats, WriteCallback};

pub use evstream_wire::{Chunk, StreamOptions};
