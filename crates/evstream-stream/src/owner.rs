//! ストリームと多重化器の境界

use evstream_wire::Chunk;

/// 送信したチャンクの完了通知（相手の ack）。失敗時はメッセージ
pub type WriteDone = Box<dyn FnOnce(Result<(), String>)>;

/// 受信したチャンクを受け入れたことを相手に返す継続
pub type Accepted = Box<dyn FnOnce()>;

/// バインド済みストリームが呼び出す、所属多重化器の操作
///
/// 各操作はストリーム ID とペイロードを対応する制御イベントでトランスポートに渡すだけ。
/// ストリームは所有者を弱参照で保持する。
pub trait StreamOwner {
    /// 相手の書き込み側にデータを要求する
    fn read(&self, id: &str, size: usize);

    /// チャンクを 1 つ送る。`done` は相手の ack で必ず一度呼ばれる
    fn write(&self, id: &str, chunk: Chunk, done: WriteDone);

    /// 書き込み側の終了を通知する
    fn end(&self, id: &str);

    /// こちら側の障害を通知する（メッセージのみ）
    fn error(&self, id: &str, message: &str);

    /// ストリームが完全に閉じたのでレジストリから外す
    fn cleanup(&self, id: &str);
}
