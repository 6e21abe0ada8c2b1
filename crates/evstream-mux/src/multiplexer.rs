//! ストリーム多重化器
//!
//! アプリケーションイベントの符号化・復号と、4 種の制御メッセージの振り分けを行う。
//!
//! ## レジストリの規則
//!
//! - 送信側（符号化）: バインド済み・破棄済みのストリーム、または ID が既に登録されている
//!   ストリームはエラーで拒否する
//! - 受信側（復号）: ID が既に登録されていれば、ローカルでは失敗させずに
//!   相手へ `error` 制御メッセージを返す。既存のストリームはそのまま残る
//! - 接続断: 登録中のすべてのストリームを強制終了し、レジストリを空にする
//! - 符号化・復号が途中で失敗したら、その呼び出しで登録したストリームの登録を取り消す

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::mem;
use std::rc::{Rc, Weak};

use evstream_codec::{Decoder, Encoder, Value};
use evstream_stream::{Accepted, Chunk, IoStream, StreamError, StreamOwner, WriteDone};
use evstream_wire::{
    Encoding, WireValue, BASE_EVENT, DISCONNECT_EVENT, END_EVENT, ERROR_EVENT, READ_EVENT,
    TRANSPORT_ERROR_EVENT, WRITE_EVENT,
};
use log::{debug, trace, warn};

use crate::error::{MuxError, Result};
use crate::event::{EventKind, ReservedEvent};
use crate::options::MultiplexerOptions;
use crate::reply::Reply;
use crate::transport::{Ack, Handler, Transport};

type Listener = Rc<dyn Fn(&[Value], Option<Reply>)>;

/// 1 接続分のストリーム多重化器
///
/// clone しても同じ多重化器を指す。トランスポートは弱参照で保持するので、
/// トランスポートの寿命はアプリケーションが管理する。
#[derive(Clone)]
pub struct Multiplexer {
    inner: Rc<MuxInner>,
}

pub(crate) struct MuxInner {
    transport: Weak<dyn Transport>,
    options: MultiplexerOptions,
    encoder: Encoder,
    decoder: Decoder,
    /// ID → ストリーム
    streams: RefCell<HashMap<String, IoStream>>,
    listeners: RefCell<HashMap<String, Vec<Listener>>>,
    this: Weak<MuxInner>,
}

impl Multiplexer {
    /// トランスポートに多重化器を取り付ける
    ///
    /// ベースイベント・制御イベント・`disconnect`・`error` のハンドラを登録する。
    /// ハンドラは多重化器を弱参照で持つので、多重化器を落とせば以降の受信は無視される。
    pub fn new<T: Transport + 'static>(transport: &Rc<T>, options: MultiplexerOptions) -> Self {
        let transport: Rc<dyn Transport> = transport.clone();
        let inner = Rc::new_cyclic(|this| MuxInner {
            transport: Rc::downgrade(&transport),
            encoder: Encoder::new(options.max_depth),
            decoder: Decoder::new(options.max_depth),
            options,
            streams: RefCell::new(HashMap::new()),
            listeners: RefCell::new(HashMap::new()),
            this: this.clone(),
        });

        let weak = Rc::downgrade(&inner);
        transport.on(BASE_EVENT, route(&weak, MuxInner::on_base_event));
        transport.on(READ_EVENT, route(&weak, MuxInner::on_read));
        transport.on(WRITE_EVENT, route(&weak, MuxInner::on_write));
        transport.on(END_EVENT, route(&weak, MuxInner::on_end));
        transport.on(ERROR_EVENT, route(&weak, MuxInner::on_error));
        transport.on(DISCONNECT_EVENT, route(&weak, MuxInner::on_disconnect));
        transport.on(TRANSPORT_ERROR_EVENT, route(&weak, MuxInner::on_transport_error));

        debug!("multiplexer attached (force_base64={})", inner.options.force_base64);
        Multiplexer { inner }
    }

    pub fn options(&self) -> &MultiplexerOptions {
        &self.inner.options
    }

    /// イベントを送る
    ///
    /// 予約イベントはローカルのリスナーにだけ届く。
    /// それ以外は引数を符号化し（含まれるストリームはここで登録される）、相手に送る。
    ///
    /// # エラー
    /// - `MuxError::AlreadySent` / `MuxError::DuplicateId`: ストリームを登録できない
    /// - `MuxError::Codec`: ネストが深すぎる
    /// - `MuxError::TransportGone`: トランスポートが破棄済み
    pub fn emit(&self, event: &str, args: Vec<Value>) -> Result<()> {
        self.inner.emit(event, args, None)
    }

    /// 応答付きでイベントを送る
    ///
    /// 相手のリスナーが返信すると、その引数を復号してから `callback` を呼ぶ。
    ///
    /// # エラー
    /// - `MuxError::ReservedEvent`: 予約イベントには応答がない（ローカルにも配送しない）
    /// - ほかは [`Multiplexer::emit`] と同じ
    pub fn emit_with_ack(
        &self,
        event: &str,
        args: Vec<Value>,
        callback: impl FnOnce(Result<Vec<Value>>) + 'static,
    ) -> Result<()> {
        if matches!(EventKind::classify(event), EventKind::Reserved(_)) {
            return Err(MuxError::ReservedEvent(event.to_string()));
        }
        let weak = Rc::downgrade(&self.inner);
        let ack: Ack = Box::new(move |reply| {
            let result = match weak.upgrade() {
                Some(inner) => inner.decode_args(&reply),
                None => Err(MuxError::MultiplexerGone),
            };
            callback(result);
        });
        self.inner.emit(event, args, Some(ack))
    }

    /// リスナーを登録する
    ///
    /// 登録前に `newListener`（引数: イベント名）が発火する。
    pub fn on(&self, event: &str, listener: impl Fn(&[Value], Option<Reply>) + 'static) {
        self.inner.dispatch_local(ReservedEvent::NewListener, vec![Value::from(event)]);
        self.inner
            .listeners
            .borrow_mut()
            .entry(event.to_string())
            .or_default()
            .push(Rc::new(listener));
    }

    /// イベントのリスナーをすべて外す。外したものがあれば `removeListener` が発火する
    pub fn off(&self, event: &str) {
        let removed = self.inner.listeners.borrow_mut().remove(event);
        if removed.is_some_and(|l| !l.is_empty()) {
            self.inner.dispatch_local(ReservedEvent::RemoveListener, vec![Value::from(event)]);
        }
    }

    pub fn listener_count(&self, event: &str) -> usize {
        self.inner.listeners.borrow().get(event).map_or(0, Vec::len)
    }

    /// 登録中のストリーム数
    pub fn stream_count(&self) -> usize {
        self.inner.streams.borrow().len()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner.streams.borrow().contains_key(id)
    }

    pub fn stream(&self, id: &str) -> Option<IoStream> {
        self.inner.streams.borrow().get(id).cloned()
    }
}

impl PartialEq for Multiplexer {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for Multiplexer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Multiplexer")
            .field("options", &self.inner.options)
            .field("streams", &self.stream_count())
            .finish()
    }
}

/// 受信ハンドラを多重化器のメソッドにつなぐ
fn route(
    weak: &Weak<MuxInner>,
    method: fn(&MuxInner, Vec<WireValue>, Option<Ack>),
) -> Handler {
    let weak = weak.clone();
    Box::new(move |args, ack| match weak.upgrade() {
        Some(inner) => method(&inner, args, ack),
        None => trace!("multiplexer dropped; ignoring incoming message"),
    })
}

impl MuxInner {
    // ============================================================
    // アプリケーションイベント
    // ============================================================

    fn emit(&self, event: &str, args: Vec<Value>, ack: Option<Ack>) -> Result<()> {
        match EventKind::classify(event) {
            EventKind::Reserved(reserved) => {
                self.dispatch_local(reserved, args);
                Ok(())
            }
            EventKind::Stream(name) => {
                let (encoded, registered) = self.encode_args(&args)?;
                let mut wire = Vec::with_capacity(encoded.len() + 1);
                wire.push(WireValue::from(name));
                wire.extend(encoded);
                trace!("emit {} ({} args)", name, args.len());
                if let Err(e) = self.send(BASE_EVENT, wire, ack) {
                    self.unregister(&registered);
                    return Err(e);
                }
                for stream in &registered {
                    stream.send_deferred_demand();
                }
                Ok(())
            }
        }
    }

    /// 引数を符号化する（見つかったストリームは送信側として登録）
    ///
    /// 2 つめの戻り値はこの呼び出しで登録したストリーム。
    /// 途中で失敗した場合は、それまでに登録したものを取り消してからエラーを返す。
    pub(crate) fn encode_args(&self, args: &[Value]) -> Result<(Vec<WireValue>, Vec<IoStream>)> {
        let mut registered = Vec::new();
        let mut encoded = Vec::with_capacity(args.len());
        for arg in args {
            let result = self.encoder.encode(arg, |stream| {
                self.register_outgoing(stream)?;
                registered.push(stream.clone());
                Ok::<_, MuxError>(())
            });
            match result {
                Ok(wire) => encoded.push(wire),
                Err(e) => {
                    self.unregister(&registered);
                    return Err(e);
                }
            }
        }
        Ok((encoded, registered))
    }

    /// 引数を復号する（見つかったストリームは受信側として登録）
    ///
    /// 途中で失敗した場合は、この呼び出しで登録したものを取り消す。
    fn decode_args(&self, args: &[WireValue]) -> Result<Vec<Value>> {
        let mut registered = Vec::new();
        let mut decoded = Vec::with_capacity(args.len());
        for arg in args {
            let result = self.decoder.decode(arg, |stream| {
                if self.register_incoming(stream) {
                    registered.push(stream.clone());
                }
                Ok::<_, MuxError>(())
            });
            match result {
                Ok(value) => decoded.push(value),
                Err(e) => {
                    self.unregister(&registered);
                    return Err(e);
                }
            }
        }
        Ok(decoded)
    }

    fn on_base_event(&self, mut args: Vec<WireValue>, ack: Option<Ack>) {
        if args.is_empty() {
            warn!("{} without an event name", BASE_EVENT);
            return;
        }
        let name = match args.remove(0) {
            WireValue::String(name) => name,
            other => {
                warn!("{} with a non-string event name: {:?}", BASE_EVENT, other);
                return;
            }
        };

        let listeners = self.listeners_for(&name);
        if listeners.is_empty() {
            trace!("no listener for {}; dropping payload", name);
            return;
        }

        let values = match self.decode_args(&args) {
            Ok(values) => values,
            Err(e) => {
                warn!("failed to decode arguments of {}: {}", name, e);
                if let Some(ack) = ack {
                    ack(vec![WireValue::from(e.to_string())]);
                }
                return;
            }
        };
        let reply = ack.map(|ack| Reply::new(ack, self.this.clone()));
        for listener in listeners {
            listener(&values, reply.clone());
        }
    }

    /// 予約イベントをローカルのリスナーにだけ届ける
    fn dispatch_local(&self, event: ReservedEvent, args: Vec<Value>) {
        for listener in self.listeners_for(event.name()) {
            listener(&args, None);
        }
    }

    fn listeners_for(&self, event: &str) -> Vec<Listener> {
        self.listeners.borrow().get(event).cloned().unwrap_or_default()
    }

    // ============================================================
    // レジストリ
    // ============================================================

    fn register_outgoing(&self, stream: &IoStream) -> Result<()> {
        if stream.is_bound() || stream.is_destroyed() {
            return Err(MuxError::AlreadySent);
        }
        if self.streams.borrow().contains_key(stream.id()) {
            return Err(MuxError::DuplicateId(stream.id().to_string()));
        }
        self.bind(stream).map_err(|_| MuxError::AlreadySent)
    }

    /// 登録できたら true。ID の衝突は相手に報告するだけで、復号は続ける
    fn register_incoming(&self, stream: &IoStream) -> bool {
        if self.streams.borrow().contains_key(stream.id()) {
            let message = format!("Decoded stream already exists: {}", stream.id());
            warn!("{}", message);
            self.error(stream.id(), &message);
            return false;
        }
        // 相手が採番した ID なので新規ストリームへのバインドは失敗しない
        match self.bind(stream) {
            Ok(()) => true,
            Err(e) => {
                warn!("failed to bind decoded stream {}: {}", stream.id(), e);
                false
            }
        }
    }

    /// 登録を取り消し、ストリームを未バインドに戻す
    pub(crate) fn unregister(&self, streams: &[IoStream]) {
        for stream in streams {
            stream.detach();
            self.cleanup(stream.id());
        }
    }

    fn bind(&self, stream: &IoStream) -> core::result::Result<(), StreamError> {
        let owner: Weak<dyn StreamOwner> = self.this.clone();
        stream.attach(owner)?;
        self.streams
            .borrow_mut()
            .insert(stream.id().to_string(), stream.clone());
        debug!("stream {} registered ({} total)", stream.id(), self.streams.borrow().len());
        Ok(())
    }

    fn lookup(&self, args: &[WireValue], event: &str) -> Option<IoStream> {
        let Some(id) = args.first().and_then(WireValue::as_str) else {
            warn!("{} without a stream id", event);
            return None;
        };
        let stream = self.streams.borrow().get(id).cloned();
        if stream.is_none() {
            trace!("{} for unknown stream {}", event, id);
        }
        stream
    }

    // ============================================================
    // 制御メッセージの受信
    // ============================================================

    fn on_read(&self, args: Vec<WireValue>, _ack: Option<Ack>) {
        let Some(stream) = self.lookup(&args, READ_EVENT) else {
            return;
        };
        let size = args
            .get(1)
            .and_then(WireValue::as_u64)
            .map_or_else(|| stream.options().effective_high_water_mark(), |n| n as usize);
        stream.on_remote_read(size);
    }

    fn on_write(&self, mut args: Vec<WireValue>, ack: Option<Ack>) {
        let Some(stream) = self.lookup(&args, WRITE_EVENT) else {
            let id = args.first().and_then(WireValue::as_str).unwrap_or_default();
            if let Some(ack) = ack {
                ack(vec![WireValue::from(format!("invalid stream id: {}", id))]);
            }
            return;
        };

        let encoding = match args.get(2).and_then(WireValue::as_str) {
            Some(name) => Encoding::from_wire(name).unwrap_or_else(|| {
                warn!("unknown chunk encoding {:?}; treating as buffer", name);
                Encoding::Buffer
            }),
            None => Encoding::Buffer,
        };
        let value = if args.len() > 1 {
            mem::replace(&mut args[1], WireValue::Undefined)
        } else {
            WireValue::Undefined
        };

        match Chunk::from_wire(value, encoding, stream.options().is_object_mode()) {
            Ok(chunk) => {
                let accepted: Accepted = match ack {
                    Some(ack) => Box::new(move || ack(Vec::new())),
                    None => Box::new(|| {}),
                };
                stream.on_remote_write(chunk, accepted);
            }
            Err(e) => {
                warn!("malformed chunk for stream {}: {}", stream.id(), e);
                if let Some(ack) = ack {
                    ack(vec![WireValue::from(e.to_string())]);
                }
            }
        }
    }

    fn on_end(&self, args: Vec<WireValue>, _ack: Option<Ack>) {
        if let Some(stream) = self.lookup(&args, END_EVENT) {
            stream.on_remote_end();
        }
    }

    fn on_error(&self, args: Vec<WireValue>, _ack: Option<Ack>) {
        if let Some(stream) = self.lookup(&args, ERROR_EVENT) {
            let message = args
                .get(1)
                .and_then(WireValue::as_str)
                .unwrap_or("unknown error")
                .to_string();
            stream.on_remote_error(message);
        }
    }

    fn on_disconnect(&self, _args: Vec<WireValue>, _ack: Option<Ack>) {
        let streams = mem::take(&mut *self.streams.borrow_mut());
        debug!("transport disconnected; aborting {} streams", streams.len());
        for stream in streams.into_values() {
            stream.abort(StreamError::ConnectionAborted);
        }
    }

    fn on_transport_error(&self, args: Vec<WireValue>, _ack: Option<Ack>) {
        // 予約イベントはコーデックを通さない。プレースホルダの形でもただのオブジェクト
        let values = args.into_iter().map(Value::from).collect();
        self.dispatch_local(ReservedEvent::Error, values);
    }

    // ============================================================
    // 送信
    // ============================================================

    fn send(&self, event: &str, args: Vec<WireValue>, ack: Option<Ack>) -> Result<()> {
        let transport = self.transport.upgrade().ok_or(MuxError::TransportGone)?;
        transport.emit(event, args, ack);
        Ok(())
    }

    fn send_control(&self, event: &str, args: Vec<WireValue>) {
        if let Err(e) = self.send(event, args, None) {
            warn!("dropping {}: {}", event, e);
        }
    }
}

impl StreamOwner for MuxInner {
    fn read(&self, id: &str, size: usize) {
        self.send_control(READ_EVENT, vec![WireValue::from(id), WireValue::from(size)]);
    }

    fn write(&self, id: &str, chunk: Chunk, done: WriteDone) {
        let Some(transport) = self.transport.upgrade() else {
            done(Err(MuxError::TransportGone.to_string()));
            return;
        };
        let (value, encoding) = chunk.into_wire(self.options.force_base64);
        let ack: Ack = Box::new(move |reply| {
            match reply.into_iter().next() {
                Some(err) if !err.is_nullish() => {
                    let message = err.as_str().map_or_else(|| format!("{:?}", err), str::to_string);
                    done(Err(message))
                }
                _ => done(Ok(())),
            }
        });
        let args = vec![WireValue::from(id), value, WireValue::from(encoding.as_str())];
        transport.emit(WRITE_EVENT, args, Some(ack));
    }

    fn end(&self, id: &str) {
        self.send_control(END_EVENT, vec![WireValue::from(id)]);
    }

    fn error(&self, id: &str, message: &str) {
        self.send_control(ERROR_EVENT, vec![WireValue::from(id), WireValue::from(message)]);
    }

    fn cleanup(&self, id: &str) {
        if self.streams.borrow_mut().remove(id).is_some() {
            debug!("stream {} removed ({} left)", id, self.streams.borrow().len());
        }
    }
}
