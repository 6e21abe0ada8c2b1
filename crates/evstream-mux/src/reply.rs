//! 問い合わせへの返信

use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};

use evstream_codec::Value;

use crate::error::{MuxError, Result};
use crate::multiplexer::MuxInner;
use crate::transport::Ack;

/// 相手が ack を付けて送ってきたイベントへの返信
///
/// 同じイベントの全リスナーに複製されて渡るが、実際に送れるのは最初の 1 回だけ。
/// 返信に含めたストリームは返信側の多重化器に登録される。
#[derive(Clone)]
pub struct Reply {
    ack: Rc<RefCell<Option<Ack>>>,
    mux: Weak<MuxInner>,
}

impl Reply {
    pub(crate) fn new(ack: Ack, mux: Weak<MuxInner>) -> Self {
        Reply {
            ack: Rc::new(RefCell::new(Some(ack))),
            mux,
        }
    }

    /// 既に返信済みか
    pub fn is_sent(&self) -> bool {
        self.ack.borrow().is_none()
    }

    /// 返信を送る
    ///
    /// # エラー
    /// - `MuxError::AlreadyReplied`: 返信済み
    /// - `MuxError::MultiplexerGone`: 多重化器が破棄済み
    /// - 符号化・ストリーム登録のエラー（この場合は返信済みにならない）
    pub fn send(&self, args: Vec<Value>) -> Result<()> {
        if self.is_sent() {
            return Err(MuxError::AlreadyReplied);
        }
        let mux = self.mux.upgrade().ok_or(MuxError::MultiplexerGone)?;
        let (encoded, registered) = mux.encode_args(&args)?;

        let Some(ack) = self.ack.borrow_mut().take() else {
            mux.unregister(&registered);
            return Err(MuxError::AlreadyReplied);
        };
        ack(encoded);
        for stream in &registered {
            stream.send_deferred_demand();
        }
        Ok(())
    }
}

impl fmt::Debug for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reply").field("sent", &self.is_sent()).finish()
    }
}
