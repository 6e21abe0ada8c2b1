//! `std::io::Read` からストリームへの流し込み
//!
//! 書き込み側のバックプレッシャーに従い、`write` が `false` を返したら止まる。
//! `Drain` を待って `pump` を呼び直せば続きから流れる。EOF でストリームを `end` し、
//! 読み取りエラーはストリームのローカル障害として報告する。

use std::cell::RefCell;
use std::io::{self, ErrorKind, Read};
use std::rc::{Rc, Weak};

use evstream_stream::{Chunk, IoStream, StreamEvent};
use log::{debug, warn};

/// `pump` の結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pump {
    /// バックプレッシャーで停止した（`Drain` 後に再開する）
    Blocked,
    /// EOF に達し、ストリームを閉じた
    Finished,
}

/// リーダーをストリームに流し込むソース
pub struct ReaderSource<R> {
    reader: R,
    stream: IoStream,
    chunk_size: usize,
    finished: bool,
    bytes: u64,
}

impl<R: Read> ReaderSource<R> {
    /// チャンクサイズはストリームの実効閾値
    pub fn new(reader: R, stream: IoStream) -> Self {
        let chunk_size = stream.options().effective_high_water_mark().max(1);
        ReaderSource {
            reader,
            stream,
            chunk_size,
            finished: false,
            bytes: 0,
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn stream(&self) -> &IoStream {
        &self.stream
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// これまでに流し込んだバイト数
    pub fn bytes_sent(&self) -> u64 {
        self.bytes
    }

    /// 書けるだけ書く
    ///
    /// # エラー
    /// - リーダーのエラー（ストリームは障害として破棄される）
    /// - ストリームが既に閉じている（`ErrorKind::BrokenPipe`）
    pub fn pump(&mut self) -> io::Result<Pump> {
        if self.finished {
            return Ok(Pump::Finished);
        }
        let mut buf = vec![0u8; self.chunk_size];
        loop {
            let n = match self.reader.read(&mut buf) {
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("reader failed for stream {}: {}", self.stream.id(), e);
                    self.finished = true;
                    self.stream.fail(e.to_string());
                    return Err(e);
                }
            };

            if n == 0 {
                debug!("reader exhausted for stream {} ({} bytes)", self.stream.id(), self.bytes);
                self.finished = true;
                self.stream.end();
                return Ok(Pump::Finished);
            }

            let below = self
                .stream
                .write(Chunk::from(&buf[..n]))
                .map_err(|e| io::Error::new(ErrorKind::BrokenPipe, e))?;
            self.bytes += n as u64;
            if !below {
                return Ok(Pump::Blocked);
            }
        }
    }
}

/// リーダーをストリームにつなぎ、`Drain` のたびに自動で再開する
///
/// 戻り値のハンドルを保持している間だけ流し込みが続く
/// （ストリームのリスナーは弱参照しか持たない）。
pub fn pipe<R: Read + 'static>(reader: R, stream: &IoStream) -> Rc<RefCell<ReaderSource<R>>> {
    let source = Rc::new(RefCell::new(ReaderSource::new(reader, stream.clone())));

    let weak: Weak<RefCell<ReaderSource<R>>> = Rc::downgrade(&source);
    stream.on(move |event| {
        if *event != StreamEvent::Drain {
            return;
        }
        let Some(source) = weak.upgrade() else {
            return;
        };
        // pump の途中で同期的に Drain が来た場合は、外側の pump が続きを処理する
        let Ok(mut source) = source.try_borrow_mut() else {
            return;
        };
        if let Err(e) = source.pump() {
            debug!("pipe stopped: {}", e);
        }
    });

    if let Err(e) = source.borrow_mut().pump() {
        debug!("pipe stopped: {}", e);
    }
    source
}

#[cfg(test)]
mod tests {
    use super::*;
    use evstream_stream::{StreamOptions, StreamOwner, WriteDone};
    use std::collections::VecDeque;

    /// 書き込みを保留し、手動で ack する所有者
    #[derive(Default)]
    struct Sink {
        written: RefCell<Vec<u8>>,
        acks: RefCell<VecDeque<WriteDone>>,
        ended: RefCell<bool>,
        errors: RefCell<Vec<String>>,
    }

    impl StreamOwner for Sink {
        fn read(&self, _id: &str, _size: usize) {}
        fn write(&self, _id: &str, chunk: Chunk, done: WriteDone) {
            self.written.borrow_mut().extend_from_slice(chunk.as_bytes().unwrap());
            self.acks.borrow_mut().push_back(done);
        }
        fn end(&self, _id: &str) {
            *self.ended.borrow_mut() = true;
        }
        fn error(&self, _id: &str, message: &str) {
            self.errors.borrow_mut().push(message.to_string());
        }
        fn cleanup(&self, _id: &str) {}
    }

    fn bound_stream(hwm: usize) -> (IoStream, Rc<Sink>) {
        let sink = Rc::new(Sink::default());
        let stream = IoStream::new(
            StreamOptions::default()
                .with_high_water_mark(hwm)
                .with_allow_half_open(true),
        );
        let owner: Weak<dyn StreamOwner> = Rc::downgrade(&sink) as Weak<dyn StreamOwner>;
        stream.attach(owner).unwrap();
        (stream, sink)
    }

    /// 相手が要求し続けて、ack を返し続ける
    fn drain(stream: &IoStream, sink: &Sink) {
        loop {
            stream.on_remote_read(1024);
            let done = sink.acks.borrow_mut().pop_front();
            match done {
                Some(done) => done(Ok(())),
                None => break,
            }
        }
    }

    #[test]
    fn test_pump_stops_on_backpressure() {
        let (stream, _sink) = bound_stream(4);
        let mut source = ReaderSource::new(&b"abcdefgh"[..], stream).with_chunk_size(4);

        assert_eq!(source.pump().unwrap(), Pump::Blocked);
        assert_eq!(source.bytes_sent(), 4);
        assert!(!source.is_finished());
    }

    #[test]
    fn test_pipe_resumes_on_drain_until_eof() {
        let (stream, sink) = bound_stream(4);
        let data: Vec<u8> = (0..32).collect();
        let source = pipe(io::Cursor::new(data.clone()), &stream);

        drain(&stream, &sink);

        assert!(source.borrow().is_finished());
        assert_eq!(*sink.written.borrow(), data);
        assert!(*sink.ended.borrow());
    }

    struct Broken;

    impl Read for Broken {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Err(io::Error::new(ErrorKind::Other, "disk gone"))
        }
    }

    #[test]
    fn test_read_error_fails_stream() {
        let (stream, sink) = bound_stream(4);
        let mut source = ReaderSource::new(Broken, stream.clone());

        assert!(source.pump().is_err());
        assert!(stream.is_destroyed());
        assert_eq!(*sink.errors.borrow(), vec!["disk gone".to_string()]);
    }
}
