//! エンコーダ / デコーダ
//!
//! どちらも純粋な再帰変換で、トランスポートには触れない。
//! ストリームを見つけるたびに呼び出し側のクロージャを呼ぶ。
//! クロージャのエラー型は呼び出し側が決める（`CodecError` から変換できれば何でもよい）。

use evstream_stream::IoStream;
use evstream_wire::{Placeholder, WireValue};

use crate::error::CodecError;
use crate::value::Value;

/// ネストの上限のデフォルト
pub const DEFAULT_MAX_DEPTH: usize = 128;

// ============================================================
// エンコーダ
// ============================================================

/// アプリケーション値 → ワイヤ値
#[derive(Debug, Clone, Copy)]
pub struct Encoder {
    max_depth: usize,
}

impl Default for Encoder {
    fn default() -> Self {
        Encoder::new(DEFAULT_MAX_DEPTH)
    }
}

impl Encoder {
    pub fn new(max_depth: usize) -> Self {
        Encoder { max_depth }
    }

    /// 値を符号化する
    ///
    /// ストリームはプレースホルダ（ID とオプション）に置き換わる。
    /// オプションは未設定でも空のオブジェクトとして載せる。
    /// `on_stream` はストリームごとに一度、走査順に呼ばれる。
    ///
    /// # エラー
    /// - `on_stream` が返したエラー（その時点で走査を打ち切る）
    /// - `CodecError::DepthExceeded`: ネストが上限を超えた
    pub fn encode<E, F>(&self, value: &Value, mut on_stream: F) -> Result<WireValue, E>
    where
        E: From<CodecError>,
        F: FnMut(&IoStream) -> Result<(), E>,
    {
        self.encode_at(value, 0, &mut on_stream)
    }

    fn encode_at<E, F>(&self, value: &Value, depth: usize, on_stream: &mut F) -> Result<WireValue, E>
    where
        E: From<CodecError>,
        F: FnMut(&IoStream) -> Result<(), E>,
    {
        if depth > self.max_depth {
            return Err(CodecError::DepthExceeded { limit: self.max_depth }.into());
        }
        Ok(match value {
            Value::Stream(stream) => {
                on_stream(stream)?;
                WireValue::Stream(Placeholder::new(stream.id(), Some(stream.options().clone())))
            }
            Value::Array(items) => WireValue::Array(
                items
                    .iter()
                    .map(|item| self.encode_at(item, depth + 1, on_stream))
                    .collect::<Result<_, E>>()?,
            ),
            Value::Object(map) => WireValue::Object(
                map.iter()
                    .map(|(k, v)| Ok::<_, E>((k.clone(), self.encode_at(v, depth + 1, on_stream)?)))
                    .collect::<Result<_, E>>()?,
            ),
            Value::Undefined => WireValue::Undefined,
            Value::Null => WireValue::Null,
            Value::Bool(b) => WireValue::Bool(*b),
            Value::Number(n) => WireValue::Number(n.clone()),
            Value::String(s) => WireValue::String(s.clone()),
            Value::Bytes(b) => WireValue::Bytes(b.clone()),
        })
    }
}

// ============================================================
// デコーダ
// ============================================================

/// ワイヤ値 → アプリケーション値
#[derive(Debug, Clone, Copy)]
pub struct Decoder {
    max_depth: usize,
}

impl Default for Decoder {
    fn default() -> Self {
        Decoder::new(DEFAULT_MAX_DEPTH)
    }
}

impl Decoder {
    pub fn new(max_depth: usize) -> Self {
        Decoder { max_depth }
    }

    /// 値を復号する
    ///
    /// プレースホルダごとに、その ID とオプションを持つ未バインドの新しいストリームを作り、
    /// `on_stream` に渡してから値に埋め込む。
    ///
    /// # エラー
    /// - `on_stream` が返したエラー
    /// - `CodecError::DepthExceeded`: ネストが上限を超えた
    pub fn decode<E, F>(&self, value: &WireValue, mut on_stream: F) -> Result<Value, E>
    where
        E: From<CodecError>,
        F: FnMut(&IoStream) -> Result<(), E>,
    {
        self.decode_at(value, 0, &mut on_stream)
    }

    fn decode_at<E, F>(&self, value: &WireValue, depth: usize, on_stream: &mut F) -> Result<Value, E>
    where
        E: From<CodecError>,
        F: FnMut(&IoStream) -> Result<(), E>,
    {
        if depth > self.max_depth {
            return Err(CodecError::DepthExceeded { limit: self.max_depth }.into());
        }
        Ok(match value {
            WireValue::Stream(placeholder) => {
                let options = placeholder.options.clone().unwrap_or_default();
                let stream = IoStream::with_id(placeholder.stream_id.clone(), options);
                on_stream(&stream)?;
                Value::Stream(stream)
            }
            WireValue::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|item| self.decode_at(item, depth + 1, on_stream))
                    .collect::<Result<_, E>>()?,
            ),
            WireValue::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| Ok::<_, E>((k.clone(), self.decode_at(v, depth + 1, on_stream)?)))
                    .collect::<Result<_, E>>()?,
            ),
            WireValue::Undefined => Value::Undefined,
            WireValue::Null => Value::Null,
            WireValue::Bool(b) => Value::Bool(*b),
            WireValue::Number(n) => Value::Number(n.clone()),
            WireValue::String(s) => Value::String(s.clone()),
            WireValue::Bytes(b) => Value::Bytes(b.clone()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use evstream_stream::StreamOptions;
    use proptest::prelude::*;
    use std::collections::BTreeMap;

    fn no_streams(_: &IoStream) -> Result<(), CodecError> {
        panic!("ストリームは含まれていないはず");
    }

    fn arb_value() -> impl Strategy<Value = Value> {
        let leaf = prop_oneof![
            Just(Value::Undefined),
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            any::<i64>().prop_map(Value::from),
            ".*".prop_map(Value::String),
            proptest::collection::vec(any::<u8>(), 0..16).prop_map(Value::Bytes),
        ];
        leaf.prop_recursive(6, 64, 8, |inner| {
            prop_oneof![
                proptest::collection::vec(inner.clone(), 0..8).prop_map(Value::Array),
                proptest::collection::btree_map(".*", inner, 0..8).prop_map(Value::Object),
            ]
        })
    }

    proptest! {
        #[test]
        fn prop_stream_free_values_survive_encode_decode(value in arb_value()) {
            let wire = Encoder::default().encode(&value, no_streams).unwrap();
            let back = Decoder::default().decode(&wire, no_streams).unwrap();
            prop_assert_eq!(back, value);
        }
    }

    #[test]
    fn test_stream_becomes_placeholder_with_options() {
        let stream = IoStream::with_id("abc", StreamOptions::default().with_high_water_mark(10));
        let mut seen = Vec::new();

        let wire = Encoder::default()
            .encode(&Value::from(&stream), |s| {
                seen.push(s.id().to_string());
                Ok::<_, CodecError>(())
            })
            .unwrap();

        assert_eq!(seen, vec!["abc".to_string()]);
        assert_eq!(
            wire,
            WireValue::Stream(Placeholder::new(
                "abc",
                Some(StreamOptions::default().with_high_water_mark(10))
            ))
        );
    }

    #[test]
    fn test_default_options_sent_as_empty_object() {
        let stream = IoStream::with_id("plain", StreamOptions::default());
        let wire = Encoder::default()
            .encode(&Value::from(&stream), |_| Ok::<_, CodecError>(()))
            .unwrap();
        assert_eq!(
            wire,
            WireValue::Stream(Placeholder::new("plain", Some(StreamOptions::default())))
        );
        assert_eq!(wire.to_json(), serde_json::json!({ "$stream": "plain", "options": {} }));
    }

    #[test]
    fn test_decode_builds_distinct_streams() {
        let mut nested = BTreeMap::new();
        nested.insert("nested".to_string(), WireValue::Stream(Placeholder::new("b", None)));
        let wire = WireValue::Array(vec![
            WireValue::Stream(Placeholder::new(
                "a",
                Some(StreamOptions::default().with_high_water_mark(10)),
            )),
            WireValue::Object(nested),
        ]);

        let mut order = Vec::new();
        let value = Decoder::default()
            .decode(&wire, |s| {
                order.push(s.id().to_string());
                Ok::<_, CodecError>(())
            })
            .unwrap();

        let items = value.as_array().unwrap();
        let a = items[0].as_stream().unwrap();
        let b = items[1].get("nested").and_then(Value::as_stream).unwrap();
        assert_ne!(a, b);
        assert_eq!(a.options().high_water_mark, Some(10));
        assert!(!a.is_bound(), "復号直後は未バインド");
        assert_eq!(order, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_notification_error_aborts_traversal() {
        let value = Value::Array(vec![
            Value::from(IoStream::new(StreamOptions::default())),
            Value::from(IoStream::new(StreamOptions::default())),
        ]);
        let mut calls = 0;
        let result: Result<WireValue, CodecError> = Encoder::default().encode(&value, |_| {
            calls += 1;
            Err(CodecError::DepthExceeded { limit: 0 })
        });
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_depth_bound() {
        let mut value = Value::Null;
        for _ in 0..10 {
            value = Value::Array(vec![value]);
        }
        let result = Encoder::new(5).encode(&value, no_streams);
        assert_eq!(result, Err(CodecError::DepthExceeded { limit: 5 }));

        let wire = Encoder::new(10).encode(&value, no_streams).unwrap();
        assert!(Decoder::new(10).decode(&wire, no_streams).is_ok());
        assert_eq!(
            Decoder::new(3).decode(&wire, no_streams),
            Err(CodecError::DepthExceeded { limit: 3 })
        );
    }
}
