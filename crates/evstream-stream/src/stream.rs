//! 論理ストリーム本体
//!
//! `IoStream` は共有ハンドル（シングルスレッド）。clone しても同じストリームを指す。
//!
//! ## バックプレッシャー
//!
//! ```text
//! 読み取り側                          書き込み側（相手）
//!   read(n) ─── $stream-read(id, n) ──▶ peer_demand = true
//!                                       キュー先頭のチャンクを送信
//!   push ◀── $stream-write(id, chunk) ─
//!   accepted() ──────── ack ──────────▶ 次のチャンクへ
//! ```
//!
//! 内部状態の借用はイベント発火・所有者呼び出しの前に必ず手放す。
//! リスナーや所有者から同じストリームへ再入しても安全にするため。

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::rc::{Rc, Weak};

use evstream_wire::{Chunk, StreamOptions};
use log::{debug, trace};
use uuid::Uuid;

use crate::error::StreamError;
use crate::event::StreamEvent;
use crate::owner::{Accepted, StreamOwner, WriteDone};

/// ローカルの書き込み完了コールバック
pub type WriteCallback = Box<dyn FnOnce(Result<(), StreamError>)>;

type Listener = Rc<dyn Fn(&StreamEvent)>;

/// 相手から届いたが、まだ要求していないので保留している入力
enum Incoming {
    Chunk(Chunk, Accepted),
    End,
}

/// 書き込みキューの 1 要素
struct PendingWrite {
    /// 送信時に取り出す（ack 待ちの間は None）
    chunk: Option<Chunk>,
    units: usize,
    callback: Option<WriteCallback>,
}

/// ストリーム統計（バイト数、要素モードでは要素数）
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamStats {
    /// 消費者に渡した量
    pub units_read: u64,
    /// 相手が受け入れた量
    pub units_written: u64,
}

struct State {
    // ===== 読み取り側 =====
    /// 消費者にまだ渡していないチャンク
    buffer: VecDeque<Chunk>,
    buffered: usize,
    /// 要求前に届いた入力
    incoming: VecDeque<Incoming>,
    /// `read` を送って応答待ち
    demanding: bool,
    /// バインド前に出た要求（バインド時に送る）
    unsent_demand: Option<usize>,
    /// これ以上チャンクは来ない
    read_ended: bool,
    end_emitted: bool,
    readable: bool,
    flowing: bool,

    // ===== 書き込み側 =====
    queue: VecDeque<PendingWrite>,
    queued: usize,
    /// キュー先頭を処理中（要求待ち or ack 待ち）
    writing: bool,
    /// 先頭チャンクを所有者に渡して ack 待ち
    in_flight: bool,
    /// 相手から要求が来ていて、次のチャンクをすぐ送れる
    peer_demand: bool,
    need_drain: bool,
    ending: bool,
    finished: bool,
    writable: bool,

    destroyed: bool,
    stats: StreamStats,
}

impl State {
    fn new() -> Self {
        State {
            buffer: VecDeque::new(),
            buffered: 0,
            incoming: VecDeque::new(),
            demanding: false,
            unsent_demand: None,
            read_ended: false,
            end_emitted: false,
            readable: true,
            flowing: false,
            queue: VecDeque::new(),
            queued: 0,
            writing: false,
            in_flight: false,
            peer_demand: false,
            need_drain: false,
            ending: false,
            finished: false,
            writable: true,
            destroyed: false,
            stats: StreamStats::default(),
        }
    }
}

struct Inner {
    id: String,
    options: StreamOptions,
    high_water_mark: usize,
    state: RefCell<State>,
    listeners: RefCell<Vec<Listener>>,
    /// 所属する多重化器（一度だけ設定される）
    owner: RefCell<Option<Weak<dyn StreamOwner>>>,
}

/// 多重化された双方向ストリーム
#[derive(Clone)]
pub struct IoStream {
    inner: Rc<Inner>,
}

impl IoStream {
    /// 新しい未バインドのストリームを生成する（ID はランダムに採番）
    pub fn new(options: StreamOptions) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), options)
    }

    /// ID を指定して生成する（プレースホルダのデコード用）
    pub fn with_id(id: impl Into<String>, options: StreamOptions) -> Self {
        let high_water_mark = options.effective_high_water_mark();
        IoStream {
            inner: Rc::new(Inner {
                id: id.into(),
                options,
                high_water_mark,
                state: RefCell::new(State::new()),
                listeners: RefCell::new(Vec::new()),
                owner: RefCell::new(None),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn options(&self) -> &StreamOptions {
        &self.inner.options
    }

    pub fn is_bound(&self) -> bool {
        self.inner.owner.borrow().is_some()
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.state.borrow().destroyed
    }

    pub fn is_readable(&self) -> bool {
        self.inner.state.borrow().readable
    }

    pub fn is_writable(&self) -> bool {
        self.inner.state.borrow().writable
    }

    pub fn stats(&self) -> StreamStats {
        self.inner.state.borrow().stats
    }

    /// 読み取りバッファに溜まっている量
    pub fn buffered_len(&self) -> usize {
        self.inner.state.borrow().buffered
    }

    /// イベントリスナーを登録する
    pub fn on(&self, listener: impl Fn(&StreamEvent) + 'static) {
        self.inner.listeners.borrow_mut().push(Rc::new(listener));
    }

    /// 多重化器にバインドする
    ///
    /// 一度しかバインドできない。破棄済みのストリームもバインドできない。
    /// バインド前に出た読み取り要求は保留したままで、
    /// プレースホルダを送り終えてから [`IoStream::send_deferred_demand`] で送る。
    ///
    /// # エラー
    /// - `StreamError::AlreadySent`: バインド済み、または破棄済み
    pub fn attach(&self, owner: Weak<dyn StreamOwner>) -> Result<(), StreamError> {
        if self.is_destroyed() || self.is_bound() {
            return Err(StreamError::AlreadySent);
        }
        *self.inner.owner.borrow_mut() = Some(owner);
        Ok(())
    }

    /// バインドを取り消す（送信に失敗したイベントの巻き戻し用）
    ///
    /// 保留中の読み取り要求は残るので、再度バインドすれば送られる。
    /// バインドされていなければ false。
    pub fn detach(&self) -> bool {
        self.inner.owner.borrow_mut().take().is_some()
    }

    /// バインド前に出た読み取り要求を相手に送る
    pub fn send_deferred_demand(&self) {
        if !self.is_bound() {
            return;
        }
        let unsent = self.inner.state.borrow_mut().unsent_demand.take();
        if let Some(size) = unsent {
            if let Some(owner) = self.owner() {
                trace!("stream {}: sending deferred read demand ({})", self.id(), size);
                owner.read(self.id(), size);
            }
        }
    }

    // ===== 読み取り側 =====

    /// 消費者がデータを取り出す
    ///
    /// バッファにチャンクがあれば先頭を返す。空なら相手に `size` 単位を要求して
    /// `None` を返す（要求は応答が来るまで一度しか送らない）。
    /// データが届くと `Readable` が発火する。
    pub fn read(&self, size: usize) -> Option<Chunk> {
        let chunk = {
            let mut st = self.inner.state.borrow_mut();
            if st.destroyed {
                return None;
            }
            let chunk = st.buffer.pop_front();
            if let Some(c) = &chunk {
                st.buffered -= c.units();
                st.stats.units_read += c.units() as u64;
            }
            chunk
        };

        match chunk {
            Some(chunk) => {
                self.maybe_emit_end();
                Some(chunk)
            }
            None => {
                if !self.maybe_emit_end() {
                    self.demand(size);
                }
                None
            }
        }
    }

    /// フローモードに切り替える
    ///
    /// バッファ済みのチャンクを `Data` として配送し、以降は受信のたびに
    /// `highWaterMark` 単位を自動で要求し直す。
    pub fn resume(&self) {
        let drained: Vec<Chunk> = {
            let mut st = self.inner.state.borrow_mut();
            if st.destroyed {
                return;
            }
            st.flowing = true;
            st.buffered = 0;
            let drained: Vec<Chunk> = st.buffer.drain(..).collect();
            st.stats.units_read += drained.iter().map(|c| c.units() as u64).sum::<u64>();
            drained
        };
        for chunk in drained {
            self.emit(StreamEvent::Data(chunk));
        }
        if !self.maybe_emit_end() {
            self.demand(self.inner.high_water_mark);
        }
    }

    /// 一時停止モードに戻す
    pub fn pause(&self) {
        self.inner.state.borrow_mut().flowing = false;
    }

    /// 相手から `write` 制御メッセージが届いた
    ///
    /// 要求中なら即座にバッファへ入れて `accepted` を呼ぶ。
    /// 要求していなければ、次の要求まで保留する。
    pub fn on_remote_write(&self, chunk: Chunk, accepted: Accepted) {
        let chunk = {
            let mut st = self.inner.state.borrow_mut();
            if st.destroyed {
                return;
            }
            if !st.demanding {
                st.incoming.push_back(Incoming::Chunk(chunk, accepted));
                return;
            }
            chunk
        };
        self.push_chunk(chunk);
        accepted();
        self.redemand_if_flowing();
    }

    /// 相手から `end` 制御メッセージが届いた
    pub fn on_remote_end(&self) {
        {
            let mut st = self.inner.state.borrow_mut();
            if st.destroyed {
                return;
            }
            if !st.incoming.is_empty() {
                st.incoming.push_back(Incoming::End);
                return;
            }
        }
        self.finish_read();
    }

    /// 相手から `error` 制御メッセージが届いた
    pub fn on_remote_error(&self, message: impl Into<String>) {
        self.emit_error(StreamError::Remote(message.into()));
    }

    /// 読み取り要求（保留中の入力があればそれを先に消化する）
    fn demand(&self, size: usize) {
        let has_incoming = {
            let st = self.inner.state.borrow();
            if st.destroyed || st.read_ended {
                return;
            }
            !st.incoming.is_empty()
        };
        if has_incoming {
            self.drain_incoming();
            return;
        }

        {
            let mut st = self.inner.state.borrow_mut();
            if st.demanding {
                return;
            }
            st.demanding = true;
        }
        match self.owner() {
            Some(owner) => {
                trace!("stream {}: read demand ({})", self.id(), size);
                owner.read(self.id(), size);
            }
            None => {
                self.inner.state.borrow_mut().unsent_demand = Some(size);
            }
        }
    }

    /// 保留中の入力をバッファが閾値に達するまで取り込む
    fn drain_incoming(&self) {
        loop {
            let next = {
                let mut st = self.inner.state.borrow_mut();
                if st.destroyed {
                    return;
                }
                st.incoming.pop_front()
            };
            match next {
                Some(Incoming::Chunk(chunk, accepted)) => {
                    let below = self.push_chunk(chunk);
                    accepted();
                    if !below {
                        return;
                    }
                }
                Some(Incoming::End) => {
                    self.finish_read();
                    return;
                }
                None => return,
            }
        }
    }

    /// チャンクを消費者側に渡す。戻り値はバッファが閾値未満か
    fn push_chunk(&self, chunk: Chunk) -> bool {
        let flowing = {
            let mut st = self.inner.state.borrow_mut();
            st.demanding = false;
            if !st.flowing {
                st.buffered += chunk.units();
            }
            st.flowing
        };

        if flowing {
            self.inner.state.borrow_mut().stats.units_read += chunk.units() as u64;
            self.emit(StreamEvent::Data(chunk));
        } else {
            self.inner.state.borrow_mut().buffer.push_back(chunk);
            self.emit(StreamEvent::Readable);
        }

        self.inner.state.borrow().buffered < self.inner.high_water_mark
    }

    fn redemand_if_flowing(&self) {
        let flowing = {
            let st = self.inner.state.borrow();
            st.flowing && !st.read_ended && !st.destroyed
        };
        if flowing {
            self.demand(self.inner.high_water_mark);
        }
    }

    /// 読み取り側の終端を入れる
    fn finish_read(&self) {
        {
            let mut st = self.inner.state.borrow_mut();
            if st.read_ended {
                return;
            }
            st.demanding = false;
            st.read_ended = true;
        }
        self.maybe_emit_end();
    }

    /// 終端に達していてバッファが空なら `End` を発火する。戻り値は終端に達したか
    fn maybe_emit_end(&self) -> bool {
        {
            let mut st = self.inner.state.borrow_mut();
            if !st.read_ended || !st.buffer.is_empty() {
                return false;
            }
            if st.end_emitted || st.destroyed {
                return true;
            }
            st.end_emitted = true;
        }
        self.emit(StreamEvent::End);
        self.on_read_end();
        true
    }

    /// 読み取り側が終わった後の処理
    fn on_read_end(&self) {
        let write_done = {
            let mut st = self.inner.state.borrow_mut();
            st.readable = false;
            !st.writable || st.finished
        };
        if write_done {
            self.destroy();
        } else if !self.inner.options.allows_half_open() {
            self.end();
        }
    }

    // ===== 書き込み側 =====

    /// チャンクを書き込む
    ///
    /// 戻り値はキューが閾値未満か。`false` の場合は `Drain` を待ってから続けること。
    ///
    /// # エラー
    /// - `StreamError::Destroyed`: 破棄済み
    /// - `StreamError::WriteAfterEnd`: `end()` 済み
    /// - `StreamError::ElementModeMismatch`: バイトモードに要素を書いた
    pub fn write(&self, chunk: impl Into<Chunk>) -> Result<bool, StreamError> {
        self.enqueue(chunk.into(), None)
    }

    /// 完了コールバック付きで書き込む
    ///
    /// コールバックは相手がチャンクを受け入れたとき、または失敗・破棄時に一度だけ呼ばれる。
    pub fn write_with(
        &self,
        chunk: impl Into<Chunk>,
        callback: impl FnOnce(Result<(), StreamError>) + 'static,
    ) -> Result<bool, StreamError> {
        self.enqueue(chunk.into(), Some(Box::new(callback)))
    }

    fn enqueue(&self, chunk: Chunk, callback: Option<WriteCallback>) -> Result<bool, StreamError> {
        let below = {
            let mut st = self.inner.state.borrow_mut();
            if st.destroyed {
                return Err(StreamError::Destroyed);
            }
            if st.ending {
                return Err(StreamError::WriteAfterEnd);
            }
            if chunk.is_object() && !self.inner.options.is_object_mode() {
                return Err(StreamError::ElementModeMismatch);
            }
            let units = chunk.units();
            st.queued += units;
            st.queue.push_back(PendingWrite {
                chunk: Some(chunk),
                units,
                callback,
            });
            let below = st.queued < self.inner.high_water_mark;
            if !below {
                st.need_drain = true;
            }
            below
        };
        self.process_writes();
        Ok(below)
    }

    /// 書き込み側を閉じる。キューが空になった時点で相手に `end` を送る
    pub fn end(&self) {
        {
            let mut st = self.inner.state.borrow_mut();
            if st.ending || st.destroyed {
                return;
            }
            st.ending = true;
        }
        self.maybe_finish();
    }

    /// 相手から `read` 制御メッセージが届いた
    pub fn on_remote_read(&self, size: usize) {
        let transmit = {
            let mut st = self.inner.state.borrow_mut();
            if st.destroyed {
                return;
            }
            if st.writing && !st.in_flight {
                true
            } else {
                st.peer_demand = true;
                false
            }
        };
        trace!("stream {}: peer demanded {}", self.id(), size);
        if transmit {
            self.transmit();
        }
    }

    /// キュー先頭の処理を始める（相手の要求があれば即送信）
    fn process_writes(&self) {
        let transmit = {
            let mut st = self.inner.state.borrow_mut();
            if st.destroyed || st.writing || st.queue.is_empty() {
                return;
            }
            st.writing = true;
            st.peer_demand
        };
        if transmit {
            self.transmit();
        }
    }

    fn transmit(&self) {
        let chunk = {
            let mut st = self.inner.state.borrow_mut();
            st.peer_demand = false;
            st.in_flight = true;
            st.queue.front_mut().and_then(|p| p.chunk.take())
        };
        let Some(chunk) = chunk else {
            return;
        };

        let Some(owner) = self.owner() else {
            self.complete_write(Err("stream is not attached to a multiplexer".to_string()));
            return;
        };

        let weak = Rc::downgrade(&self.inner);
        let done: WriteDone = Box::new(move |result| {
            if let Some(inner) = weak.upgrade() {
                IoStream { inner }.complete_write(result);
            }
        });
        trace!("stream {}: write {} units", self.id(), chunk.units());
        owner.write(self.id(), chunk, done);
    }

    /// 相手の ack を受けて先頭の書き込みを完了させる
    fn complete_write(&self, result: Result<(), String>) {
        let (callback, drain) = {
            let mut st = self.inner.state.borrow_mut();
            if st.destroyed {
                return;
            }
            st.writing = false;
            st.in_flight = false;
            let Some(done) = st.queue.pop_front() else {
                return;
            };
            st.queued -= done.units;
            let mut drain = false;
            if result.is_ok() {
                st.stats.units_written += done.units as u64;
                if st.need_drain && st.queued < self.inner.high_water_mark {
                    st.need_drain = false;
                    drain = true;
                }
            }
            (done.callback, drain)
        };

        match result {
            Ok(()) => {
                if let Some(callback) = callback {
                    callback(Ok(()));
                }
                if drain {
                    self.emit(StreamEvent::Drain);
                }
                self.process_writes();
                self.maybe_finish();
            }
            Err(message) => {
                let error = StreamError::Local(message);
                if let Some(callback) = callback {
                    callback(Err(error.clone()));
                }
                self.emit_error(error);
            }
        }
    }

    fn maybe_finish(&self) {
        let ready = {
            let st = self.inner.state.borrow();
            st.ending && !st.finished && !st.writing && st.queue.is_empty() && !st.destroyed
        };
        if ready {
            self.finish();
        }
    }

    /// 書き込み側の完了: 相手に `end` を送り、片側クローズの扱いを決める
    fn finish(&self) {
        {
            let mut st = self.inner.state.borrow_mut();
            st.finished = true;
            st.writable = false;
        }
        if let Some(owner) = self.owner() {
            owner.end(self.id());
        }
        self.emit(StreamEvent::Finish);

        let read_done = !self.inner.state.borrow().readable;
        if read_done {
            self.destroy();
        } else if !self.inner.options.allows_half_open() {
            self.finish_read();
        }
    }

    // ===== 障害・破棄 =====

    /// こちら側の障害を報告する（相手に通知してから破棄する）
    pub fn fail(&self, message: impl Into<String>) {
        self.emit_error(StreamError::Local(message.into()));
    }

    fn emit_error(&self, error: StreamError) {
        if !error.is_remote() && !self.is_destroyed() {
            if let Some(owner) = self.owner() {
                owner.error(self.id(), &error.to_string());
            }
        }
        let was_alive = self.destroy_inner();
        self.emit(StreamEvent::Error(error));
        if was_alive {
            self.emit(StreamEvent::Close);
        }
    }

    /// 両方向を即座に閉じる（冪等）
    pub fn destroy(&self) {
        if self.destroy_inner() {
            self.emit(StreamEvent::Close);
        }
    }

    /// 接続断による強制終了
    ///
    /// 以前の状態にかかわらず、`Close` に続けて `Error` を発火する。
    pub fn abort(&self, error: StreamError) {
        self.destroy_inner();
        self.emit(StreamEvent::Close);
        self.emit(StreamEvent::Error(error));
    }

    /// 破棄処理本体。既に破棄済みなら false
    fn destroy_inner(&self) -> bool {
        let callbacks: Vec<WriteCallback> = {
            let mut st = self.inner.state.borrow_mut();
            if st.destroyed {
                return false;
            }
            st.destroyed = true;
            st.readable = false;
            st.writable = false;
            st.demanding = false;
            st.buffer.clear();
            st.buffered = 0;
            st.incoming.clear();
            st.queued = 0;
            st.queue.drain(..).filter_map(|p| p.callback).collect()
        };

        debug!("stream {}: destroyed", self.id());
        let owner = self.inner.owner.borrow_mut().take();
        if let Some(owner) = owner.and_then(|w| w.upgrade()) {
            owner.cleanup(self.id());
        }
        for callback in callbacks {
            callback(Err(StreamError::Destroyed));
        }
        true
    }

    fn owner(&self) -> Option<Rc<dyn StreamOwner>> {
        self.inner.owner.borrow().as_ref().and_then(Weak::upgrade)
    }

    fn emit(&self, event: StreamEvent) {
        let listeners: Vec<Listener> = self.inner.listeners.borrow().clone();
        for listener in listeners {
            listener(&event);
        }
    }
}

impl PartialEq for IoStream {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for IoStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoStream")
            .field("id", &self.inner.id)
            .field("options", &self.inner.options)
            .field("bound", &self.is_bound())
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}
