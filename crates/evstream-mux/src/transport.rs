//! トランスポートの抽象
//!
//! 名前付きイベントの publish/subscribe を、接続ごとに順序を保って運ぶ双方向チャネル。
//! 応答（ack）は任意で、一度だけ呼ばれる継続として表す。

use evstream_wire::WireValue;

/// 相手への応答。引数は応答のペイロード
pub type Ack = Box<dyn FnOnce(Vec<WireValue>)>;

/// 受信ハンドラ。相手が ack を要求した場合は `Some(ack)` が渡る
pub type Handler = Box<dyn FnMut(Vec<WireValue>, Option<Ack>)>;

/// 多重化器が必要とするトランスポートの最小インターフェース
///
/// 実装は同じ接続上のメッセージを送信順に配送しなければならない。
/// 接続断は `disconnect`、トランスポート自身の障害は `error`（引数: メッセージ）
/// として `on` で登録したハンドラに届ける。
pub trait Transport {
    /// イベントを送る
    fn emit(&self, event: &str, args: Vec<WireValue>, ack: Option<Ack>);

    /// イベントの受信ハンドラを登録する
    fn on(&self, event: &str, handler: Handler);
}
