//! アプリケーション値
//!
//! イベント引数として送受信できる値。任意の位置に [`IoStream`] を含められる。

use std::collections::BTreeMap;

use evstream_stream::IoStream;
use evstream_wire::WireValue;
use serde_json::{Number, Value as Json};

/// イベント引数の値
///
/// ストリームの比較はハンドルの同一性で行う。
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Undefined,
    Null,
    Bool(bool),
    Number(Number),
    String(String),
    Bytes(Vec<u8>),
    Array(Vec<Value>),
    Object(BTreeMap<String, Value>),
    Stream(IoStream),
}

impl Value {
    /// キーと値の組からオブジェクトを作る
    pub fn object<K: Into<String>>(entries: impl IntoIterator<Item = (K, Value)>) -> Self {
        Value::Object(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    pub fn as_stream(&self) -> Option<&IoStream> {
        match self {
            Value::Stream(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::Number(n) => n.as_u64(),
            _ => None,
        }
    }

    /// オブジェクトのフィールドを取り出す
    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Value::Object(map) => map.get(key),
            _ => None,
        }
    }

}

/// ワイヤ値をそのまま写す
///
/// デコーダと違い、プレースホルダは元の JSON オブジェクトに戻すだけでストリームは作らない。
/// コーデックを通さない予約イベントの引数に使う。
impl From<WireValue> for Value {
    fn from(wire: WireValue) -> Self {
        match wire {
            WireValue::Undefined => Value::Undefined,
            WireValue::Null => Value::Null,
            WireValue::Bool(b) => Value::Bool(b),
            WireValue::Number(n) => Value::Number(n),
            WireValue::String(s) => Value::String(s),
            WireValue::Bytes(b) => Value::Bytes(b),
            WireValue::Array(items) => Value::Array(items.into_iter().map(Value::from).collect()),
            WireValue::Object(map) => Value::Object(map.into_iter().map(|(k, v)| (k, Value::from(v))).collect()),
            WireValue::Stream(placeholder) => Value::from(placeholder.to_json()),
        }
    }
}

impl From<Json> for Value {
    fn from(json: Json) -> Self {
        match json {
            Json::Null => Value::Null,
            Json::Bool(b) => Value::Bool(b),
            Json::Number(n) => Value::Number(n),
            Json::String(s) => Value::String(s),
            Json::Array(items) => Value::Array(items.into_iter().map(Value::from).collect()),
            Json::Object(map) => Value::Object(map.into_iter().map(|(k, v)| (k, Value::from(v))).collect()),
        }
    }
}

impl From<IoStream> for Value {
    fn from(stream: IoStream) -> Self {
        Value::Stream(stream)
    }
}

impl From<&IoStream> for Value {
    fn from(stream: &IoStream) -> Self {
        Value::Stream(stream.clone())
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(n.into())
    }
}

impl From<u64> for Value {
    fn from(n: u64) -> Self {
        Value::Number(n.into())
    }
}

impl From<Vec<u8>> for Value {
    fn from(bytes: Vec<u8>) -> Self {
        Value::Bytes(bytes)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::Array(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use evstream_stream::StreamOptions;
    use serde_json::json;

    #[test]
    fn test_from_json() {
        let value = Value::from(json!({ "a": [1, null, "x"], "b": true }));
        assert_eq!(value.get("b"), Some(&Value::Bool(true)));
        let a = value.get("a").and_then(Value::as_array).unwrap();
        assert_eq!(a[0].as_u64(), Some(1));
        assert_eq!(a[1], Value::Null);
        assert_eq!(a[2].as_str(), Some("x"));
    }

    #[test]
    fn test_streams_compare_by_identity() {
        let a = IoStream::with_id("same", StreamOptions::default());
        let b = IoStream::with_id("same", StreamOptions::default());
        assert_eq!(Value::from(&a), Value::from(&a));
        assert_ne!(Value::from(&a), Value::from(&b), "同じ ID でも別ハンドルは別物");
    }

    #[test]
    fn test_from_wire_keeps_placeholder_as_object() {
        let wire = WireValue::Array(vec![
            WireValue::from(json!({ "$stream": "x" })),
            WireValue::Bytes(vec![7]),
        ]);
        let value = Value::from(wire);

        let items = value.as_array().unwrap();
        assert!(items[0].as_stream().is_none(), "ストリームは作らない");
        assert_eq!(items[0].get("$stream").and_then(Value::as_str), Some("x"));
        assert_eq!(items[1], Value::Bytes(vec![7]));
    }
}
