//! # evstream
//!
//! イベントの引数に双方向バイトストリームを埋め込み、1 本のメッセージ接続上で多重化する。
//!
//! ```text
//! 送信側                                   受信側
//!   let s = create_stream(opts);
//!   mux.emit("upload", [s, name])  ──▶   mux.on("upload", |args, _| args[0] は IoStream)
//!   s.write(bytes)                 ◀──   read 要求 ($stream-read)
//!                                  ──▶   チャンク ($stream-write) + ack
//! ```
//!
//! ## 構成
//!
//! | クレート          | 役割                                         |
//! |-------------------|----------------------------------------------|
//! | `evstream-wire`   | ワイヤ値・プレースホルダ・チャンク符号化     |
//! | `evstream-stream` | 論理ストリームの状態機械                     |
//! | `evstream-codec`  | 値の符号化・復号                             |
//! | `evstream-mux`    | 多重化器とトランスポートの抽象               |
//! | `evstream`        | 本クレート。`lookup` などの入口              |
//!
//! ## スレッド安全性
//!
//! すべてシングルスレッド前提。`lookup` のキャッシュもスレッドごとに持つ。

pub mod memory;
pub mod source;

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use log::debug;
use serde::Deserialize;

pub use evstream_codec::{CodecError, Decoder, Encoder, Value, DEFAULT_MAX_DEPTH};
pub use evstream_mux::{
    Ack, EventKind, Handler, Multiplexer, MultiplexerOptions, MuxError, Reply, ReservedEvent, Transport,
};
pub use evstream_stream::{IoStream, StreamError, StreamEvent, StreamOwner, StreamStats};
pub use evstream_wire::{Chunk, Encoding, Placeholder, StreamOptions, WireError, WireValue};
pub use memory::MemoryTransport;
pub use source::{pipe, Pump, ReaderSource};

// ============================================================
// lookup
// ============================================================

/// `lookup` の設定。未設定の項目はスレッドごとのデフォルトに従う
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LookupOptions {
    pub force_base64: Option<bool>,
    pub max_depth: Option<usize>,
}

impl LookupOptions {
    pub fn force_base64(mut self, force: bool) -> Self {
        self.force_base64 = Some(force);
        self
    }

    fn resolve(&self) -> MultiplexerOptions {
        let defaults = MultiplexerOptions::default();
        MultiplexerOptions {
            force_base64: self
                .force_base64
                .unwrap_or_else(|| DEFAULT_FORCE_BASE64.with(Cell::get)),
            max_depth: self.max_depth.unwrap_or(defaults.max_depth),
        }
    }
}

type CacheEntry = (Weak<dyn Transport>, Multiplexer);

thread_local! {
    /// トランスポート → 多重化器。トランスポートは弱参照で持つ
    static MULTIPLEXERS: RefCell<Vec<CacheEntry>> = const { RefCell::new(Vec::new()) };
    static DEFAULT_FORCE_BASE64: Cell<bool> = const { Cell::new(false) };
}

/// `forceBase64` のデフォルトを変更する（このスレッドで以降に作られる多重化器に効く）
pub fn set_default_force_base64(force: bool) {
    DEFAULT_FORCE_BASE64.with(|d| d.set(force));
}

/// トランスポートに対応する多重化器を返す
///
/// トランスポートごとに一つだけ作られ、2 回目以降は同じものが返る。
/// 設定は最初の呼び出しのものだけが使われる。
/// 破棄されたトランスポートの項目は呼び出しのたびに掃除される。
pub fn lookup<T: Transport + 'static>(transport: &Rc<T>, options: LookupOptions) -> Multiplexer {
    let key = Rc::as_ptr(transport) as *const ();

    let cached = MULTIPLEXERS.with(|cache| {
        let mut cache = cache.borrow_mut();
        cache.retain(|(weak, _)| weak.strong_count() > 0);
        cache
            .iter()
            .find(|(weak, _)| Weak::as_ptr(weak) as *const () == key)
            .map(|(_, mux)| mux.clone())
    });
    if let Some(mux) = cached {
        return mux;
    }

    let mux = Multiplexer::new(transport, options.resolve());
    let as_dyn: Rc<dyn Transport> = transport.clone();
    MULTIPLEXERS.with(|cache| cache.borrow_mut().push((Rc::downgrade(&as_dyn), mux.clone())));
    debug!("created multiplexer for transport {:p}", key);
    mux
}

/// 未バインドの新しいストリームを作る
pub fn create_stream(options: StreamOptions) -> IoStream {
    IoStream::new(options)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_memoizes_per_transport() {
        let (a, b) = MemoryTransport::pair();
        let first = lookup(&a, LookupOptions::default());
        let again = lookup(&a, LookupOptions::default().force_base64(true));
        let other = lookup(&b, LookupOptions::default());

        assert_eq!(first, again);
        assert_ne!(first, other);
        assert!(!again.options().force_base64, "最初の設定が使われる");
    }

    #[test]
    fn test_default_force_base64() {
        set_default_force_base64(true);
        let (a, _b) = MemoryTransport::pair();
        let mux = lookup(&a, LookupOptions::default());
        set_default_force_base64(false);
        assert!(mux.options().force_base64);

        let (c, _d) = MemoryTransport::pair();
        let explicit = lookup(&c, LookupOptions::default().force_base64(false));
        assert!(!explicit.options().force_base64);
    }

    #[test]
    fn test_dropped_transport_pruned() {
        let (a, b) = MemoryTransport::pair();
        let mux = lookup(&a, LookupOptions::default());
        drop(a);
        drop(b);

        // 新しいトランスポートは別の多重化器になる
        let (c, _d) = MemoryTransport::pair();
        assert_ne!(lookup(&c, LookupOptions::default()), mux);
        let live = MULTIPLEXERS.with(|cache| cache.borrow().len());
        assert_eq!(live, 1);
    }

    #[test]
    fn test_lookup_options_deserialize() {
        let options: LookupOptions = serde_json::from_str(r#"{ "forceBase64": true }"#).unwrap();
        assert_eq!(options.force_base64, Some(true));
        assert_eq!(options.max_depth, None);
    }

    #[test]
    fn test_create_stream_is_unbound() {
        let stream = create_stream(StreamOptions::default().with_high_water_mark(10));
        assert!(!stream.is_bound());
        assert_eq!(stream.options().high_water_mark, Some(10));
    }
}
