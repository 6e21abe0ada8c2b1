//! # evstream-codec
//!
//! アプリケーション値とワイヤ値の相互変換。
//!
//! ```text
//! encode: Value  ──(Stream → Placeholder, 発見通知)──▶ WireValue
//! decode: WireValue ──(Placeholder → 新しい IoStream, 発見通知)──▶ Value
//! ```
//!
//! 発見通知は走査が終わる前に同期的に呼ばれる。多重化器はここでストリームを
//! 登録するので、ペイロードがトランスポートやリスナーに届く時点で
//! ストリームは必ず登録済みになる。
//!
//! 循環した入力は扱わない。ネストが `max_depth` を超えた時点で失敗する。

pub mod codec;
pub mod error;
pub mod value;

pub use codec::{Decoder, Encoder, DEFAULT_MAX_DEPTH};
pub use error::CodecError;
pub use value::Value;
