//! インメモリトランスポート
//!
//! 接続された 2 つの端点。送信はキューに積まれ、`pump()` で送信順に配送される。
//! ack も相手からの応答フレームとして同じキューを通る。
//!
//! JSON モードでは、すべての引数を `serde_json` で往復させてから配送する。
//! バイナリは octet 配列になり、`undefined` は `null` になる（バイナリを運べない
//! トランスポートの再現）。

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::rc::{Rc, Weak};

use evstream_mux::{Ack, Handler, Transport};
use evstream_wire::{WireValue, DISCONNECT_EVENT, TRANSPORT_ERROR_EVENT};
use log::trace;

/// キュー上のフレーム
enum Frame {
    Event {
        to: usize,
        event: String,
        args: Vec<WireValue>,
        ack_id: Option<u64>,
    },
    Ack {
        to: usize,
        ack_id: u64,
        args: Vec<WireValue>,
    },
}

/// 2 端点が共有する回線
struct Link {
    queue: RefCell<VecDeque<Frame>>,
    endpoints: RefCell<[Weak<MemoryTransport>; 2]>,
    json: bool,
    connected: Cell<bool>,
}

impl Link {
    fn carry(&self, args: Vec<WireValue>) -> Vec<WireValue> {
        if !self.json {
            return args;
        }
        args.into_iter()
            .map(|arg| match serde_json::to_value(&arg) {
                Ok(json) => WireValue::from(json),
                Err(_) => WireValue::Null,
            })
            .collect()
    }

    fn push(&self, frame: Frame) {
        if !self.connected.get() {
            trace!("memory transport: dropping frame after disconnect");
            return;
        }
        self.queue.borrow_mut().push_back(frame);
    }

    fn endpoint(&self, side: usize) -> Option<Rc<MemoryTransport>> {
        self.endpoints.borrow()[side].upgrade()
    }
}

/// インメモリトランスポートの端点
pub struct MemoryTransport {
    link: Rc<Link>,
    side: usize,
    handlers: RefCell<HashMap<String, Vec<Handler>>>,
    /// 相手の応答待ちの ack
    pending_acks: RefCell<HashMap<u64, Ack>>,
    next_ack_id: Cell<u64>,
}

impl MemoryTransport {
    /// 接続された 2 端点を作る
    pub fn pair() -> (Rc<Self>, Rc<Self>) {
        Self::build(false)
    }

    /// JSON しか運べない 2 端点を作る
    pub fn json_pair() -> (Rc<Self>, Rc<Self>) {
        Self::build(true)
    }

    fn build(json: bool) -> (Rc<Self>, Rc<Self>) {
        let link = Rc::new(Link {
            queue: RefCell::new(VecDeque::new()),
            endpoints: RefCell::new([Weak::new(), Weak::new()]),
            json,
            connected: Cell::new(true),
        });
        let a = Rc::new(Self::endpoint(link.clone(), 0));
        let b = Rc::new(Self::endpoint(link.clone(), 1));
        *link.endpoints.borrow_mut() = [Rc::downgrade(&a), Rc::downgrade(&b)];
        (a, b)
    }

    fn endpoint(link: Rc<Link>, side: usize) -> Self {
        MemoryTransport {
            link,
            side,
            handlers: RefCell::new(HashMap::new()),
            pending_acks: RefCell::new(HashMap::new()),
            next_ack_id: Cell::new(0),
        }
    }

    /// 配送待ちのフレーム数
    pub fn pending(&self) -> usize {
        self.link.queue.borrow().len()
    }

    pub fn is_connected(&self) -> bool {
        self.link.connected.get()
    }

    /// キューが空になるまで配送する。戻り値は配送したフレーム数
    ///
    /// 配送中に積まれたフレームも同じ呼び出しで配送される。
    pub fn pump(&self) -> usize {
        let mut delivered = 0;
        loop {
            let frame = self.link.queue.borrow_mut().pop_front();
            let Some(frame) = frame else {
                return delivered;
            };
            delivered += 1;
            match frame {
                Frame::Event {
                    to,
                    event,
                    args,
                    ack_id,
                } => {
                    if let Some(endpoint) = self.link.endpoint(to) {
                        let ack = ack_id.map(|id| endpoint.reply_to(id));
                        endpoint.dispatch(&event, args, ack);
                    }
                }
                Frame::Ack { to, ack_id, args } => {
                    if let Some(endpoint) = self.link.endpoint(to) {
                        let ack = endpoint.pending_acks.borrow_mut().remove(&ack_id);
                        match ack {
                            Some(ack) => ack(args),
                            None => trace!("memory transport: unknown ack {}", ack_id),
                        }
                    }
                }
            }
        }
    }

    /// 接続を切る。未配送のフレームは捨て、両端に `disconnect` を届ける
    pub fn disconnect(&self) {
        if !self.link.connected.replace(false) {
            return;
        }
        self.link.queue.borrow_mut().clear();
        for side in 0..2 {
            if let Some(endpoint) = self.link.endpoint(side) {
                endpoint.pending_acks.borrow_mut().clear();
                endpoint.dispatch(DISCONNECT_EVENT, Vec::new(), None);
            }
        }
    }

    /// この端点にトランスポート障害を通知する
    pub fn raise_error(&self, message: &str) {
        self.dispatch(TRANSPORT_ERROR_EVENT, vec![WireValue::from(message)], None);
    }

    /// 相手の端点に向けた応答を作る
    fn reply_to(&self, ack_id: u64) -> Ack {
        let link = Rc::downgrade(&self.link);
        let to = 1 - self.side;
        Box::new(move |args| {
            if let Some(link) = link.upgrade() {
                let args = link.carry(args);
                link.push(Frame::Ack { to, ack_id, args });
            }
        })
    }

    fn dispatch(&self, event: &str, args: Vec<WireValue>, ack: Option<Ack>) {
        let taken = self.handlers.borrow_mut().remove(event);
        let Some(mut handlers) = taken else {
            trace!("memory transport: no handler for {}", event);
            return;
        };

        let mut ack = ack;
        for handler in handlers.iter_mut() {
            handler(args.clone(), ack.take());
        }

        // 配送中に追加されたハンドラを後ろにつなぐ
        let mut map = self.handlers.borrow_mut();
        if let Some(added) = map.remove(event) {
            handlers.extend(added);
        }
        map.insert(event.to_string(), handlers);
    }
}

impl Transport for MemoryTransport {
    fn emit(&self, event: &str, args: Vec<WireValue>, ack: Option<Ack>) {
        if !self.is_connected() {
            trace!("memory transport: {} emitted after disconnect", event);
            return;
        }
        let ack_id = ack.map(|ack| {
            let id = self.next_ack_id.get();
            self.next_ack_id.set(id + 1);
            self.pending_acks.borrow_mut().insert(id, ack);
            id
        });
        let args = self.link.carry(args);
        self.link.push(Frame::Event {
            to: 1 - self.side,
            event: event.to_string(),
            args,
            ack_id,
        });
    }

    fn on(&self, event: &str, handler: Handler) {
        self.handlers
            .borrow_mut()
            .entry(event.to_string())
            .or_default()
            .push(handler);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorder(endpoint: &MemoryTransport, event: &str) -> Rc<RefCell<Vec<Vec<WireValue>>>> {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        endpoint.on(event, Box::new(move |args, _| sink.borrow_mut().push(args)));
        seen
    }

    #[test]
    fn test_delivery_waits_for_pump() {
        let (a, b) = MemoryTransport::pair();
        let seen = recorder(&b, "ping");

        a.emit("ping", vec![WireValue::from(1u64)], None);
        a.emit("ping", vec![WireValue::from(2u64)], None);
        assert!(seen.borrow().is_empty());
        assert_eq!(a.pending(), 2);

        assert_eq!(b.pump(), 2);
        assert_eq!(
            *seen.borrow(),
            vec![vec![WireValue::from(1u64)], vec![WireValue::from(2u64)]]
        );
    }

    #[test]
    fn test_ack_travels_back() {
        let (a, b) = MemoryTransport::pair();
        b.on("ask", Box::new(|args, ack| {
            if let Some(ack) = ack {
                ack(args);
            }
        }));

        let reply = Rc::new(RefCell::new(None));
        let slot = reply.clone();
        a.emit(
            "ask",
            vec![WireValue::from("echo")],
            Some(Box::new(move |args| *slot.borrow_mut() = Some(args))),
        );
        a.pump();
        assert_eq!(*reply.borrow(), Some(vec![WireValue::from("echo")]));
    }

    #[test]
    fn test_json_mode_loses_binary() {
        let (a, b) = MemoryTransport::json_pair();
        let seen = recorder(&b, "blob");

        a.emit("blob", vec![WireValue::Bytes(vec![1, 2]), WireValue::Undefined], None);
        a.pump();

        assert_eq!(
            seen.borrow()[0],
            vec![WireValue::from(serde_json::json!([1, 2])), WireValue::Null]
        );
    }

    #[test]
    fn test_disconnect_notifies_both_sides_and_drops_queue() {
        let (a, b) = MemoryTransport::pair();
        let da = recorder(&a, DISCONNECT_EVENT);
        let db = recorder(&b, DISCONNECT_EVENT);
        let seen = recorder(&b, "late");

        a.emit("late", Vec::new(), None);
        a.disconnect();
        a.disconnect();
        a.emit("late", Vec::new(), None);

        assert_eq!(a.pump(), 0);
        assert!(seen.borrow().is_empty());
        assert_eq!(da.borrow().len(), 1);
        assert_eq!(db.borrow().len(), 1);
        assert!(!b.is_connected());
    }
}
