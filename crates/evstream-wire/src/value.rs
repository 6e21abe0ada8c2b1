//! ワイヤ値
//!
//! トランスポートに渡せる値の全体。ストリームはここには現れず、
//! [`Placeholder`] として表現される。

use std::collections::BTreeMap;

use serde::ser::{SerializeMap, Serializer};
use serde::Serialize;
use serde_json::{Map, Number, Value as Json};

use crate::options::StreamOptions;
use crate::STREAM_MARKER;

/// トランスポート上を流れる値
///
/// `Undefined` は JSON に対応物がないため、JSON 化すると `null` になる。
#[derive(Debug, Clone, PartialEq)]
pub enum WireValue {
    Undefined,
    Null,
    Bool(bool),
    Number(Number),
    String(String),
    /// 生バイナリ。バイナリを運べないトランスポートでは octet 配列に化ける
    Bytes(Vec<u8>),
    Array(Vec<WireValue>),
    Object(BTreeMap<String, WireValue>),
    /// ストリームの代わりに置かれるプレースホルダ
    Stream(Placeholder),
}

/// ストリームのプレースホルダ
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placeholder {
    /// 送信側が採番したストリーム ID
    pub stream_id: String,
    /// 送信側のバッファリング設定（相手が省略した場合は None）
    pub options: Option<StreamOptions>,
}

impl Placeholder {
    pub fn new(stream_id: impl Into<String>, options: Option<StreamOptions>) -> Self {
        Placeholder {
            stream_id: stream_id.into(),
            options,
        }
    }

    /// JSON オブジェクトがプレースホルダなら復元する
    ///
    /// `$stream` が空でない文字列のときだけプレースホルダとみなす。
    /// `options` が解釈できない場合は未設定として扱う。
    pub fn from_json_object(map: &Map<String, Json>) -> Option<Self> {
        let id = map.get(STREAM_MARKER)?.as_str()?;
        if id.is_empty() {
            return None;
        }
        let options = map
            .get("options")
            .and_then(|o| serde_json::from_value::<StreamOptions>(o.clone()).ok());
        Some(Placeholder::new(id, options))
    }

    pub fn to_json(&self) -> Json {
        let mut map = Map::new();
        map.insert(STREAM_MARKER.to_string(), Json::String(self.stream_id.clone()));
        if let Some(options) = &self.options {
            if let Ok(json) = serde_json::to_value(options) {
                map.insert("options".to_string(), json);
            }
        }
        Json::Object(map)
    }
}

impl WireValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            WireValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            WireValue::Number(n) => n.as_u64(),
            _ => None,
        }
    }

    /// `null` または `undefined`
    pub fn is_nullish(&self) -> bool {
        matches!(self, WireValue::Null | WireValue::Undefined)
    }

    /// JSON に変換する（バイナリは octet 配列になる）
    pub fn to_json(&self) -> Json {
        match self {
            WireValue::Undefined | WireValue::Null => Json::Null,
            WireValue::Bool(b) => Json::Bool(*b),
            WireValue::Number(n) => Json::Number(n.clone()),
            WireValue::String(s) => Json::String(s.clone()),
            WireValue::Bytes(b) => Json::Array(b.iter().map(|&x| Json::from(x)).collect()),
            WireValue::Array(items) => Json::Array(items.iter().map(WireValue::to_json).collect()),
            WireValue::Object(map) => Json::Object(
                map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
            WireValue::Stream(placeholder) => placeholder.to_json(),
        }
    }
}

impl From<Json> for WireValue {
    fn from(json: Json) -> Self {
        match json {
            Json::Null => WireValue::Null,
            Json::Bool(b) => WireValue::Bool(b),
            Json::Number(n) => WireValue::Number(n),
            Json::String(s) => WireValue::String(s),
            Json::Array(items) => WireValue::Array(items.into_iter().map(WireValue::from).collect()),
            Json::Object(map) => match Placeholder::from_json_object(&map) {
                Some(placeholder) => WireValue::Stream(placeholder),
                None => WireValue::Object(
                    map.into_iter().map(|(k, v)| (k, WireValue::from(v))).collect(),
                ),
            },
        }
    }
}

impl From<&str> for WireValue {
    fn from(s: &str) -> Self {
        WireValue::String(s.to_string())
    }
}

impl From<String> for WireValue {
    fn from(s: String) -> Self {
        WireValue::String(s)
    }
}

impl From<u64> for WireValue {
    fn from(n: u64) -> Self {
        WireValue::Number(n.into())
    }
}

impl From<usize> for WireValue {
    fn from(n: usize) -> Self {
        WireValue::Number((n as u64).into())
    }
}

impl From<bool> for WireValue {
    fn from(b: bool) -> Self {
        WireValue::Bool(b)
    }
}

impl From<Vec<u8>> for WireValue {
    fn from(bytes: Vec<u8>) -> Self {
        WireValue::Bytes(bytes)
    }
}

impl Serialize for WireValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            WireValue::Undefined | WireValue::Null => serializer.serialize_unit(),
            WireValue::Bool(b) => serializer.serialize_bool(*b),
            WireValue::Number(n) => n.serialize(serializer),
            WireValue::String(s) => serializer.serialize_str(s),
            WireValue::Bytes(b) => serializer.serialize_bytes(b),
            WireValue::Array(items) => serializer.collect_seq(items),
            WireValue::Object(map) => serializer.collect_map(map),
            WireValue::Stream(placeholder) => placeholder.serialize(serializer),
        }
    }
}

impl Serialize for Placeholder {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let len = if self.options.is_some() { 2 } else { 1 };
        let mut map = serializer.serialize_map(Some(len))?;
        map.serialize_entry(STREAM_MARKER, &self.stream_id)?;
        if let Some(options) = &self.options {
            map.serialize_entry("options", options)?;
        }
        map.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_placeholder_recognized_by_marker() {
        let wire = WireValue::from(json!({ "$stream": "abc", "options": { "highWaterMark": 10 } }));
        let expected = Placeholder::new("abc", Some(StreamOptions::default().with_high_water_mark(10)));
        assert_eq!(wire, WireValue::Stream(expected));
    }

    #[test]
    fn test_empty_marker_is_plain_object() {
        let wire = WireValue::from(json!({ "$stream": "", "x": 1 }));
        assert!(matches!(wire, WireValue::Object(_)));

        // 文字列以外のマーカーも通常のオブジェクト
        let wire = WireValue::from(json!({ "$stream": 5 }));
        assert!(matches!(wire, WireValue::Object(_)));
    }

    #[test]
    fn test_unparseable_options_dropped() {
        let wire = WireValue::from(json!({ "$stream": "id", "options": "nope" }));
        assert_eq!(wire, WireValue::Stream(Placeholder::new("id", None)));
    }

    #[test]
    fn test_serialize_matches_to_json() {
        let mut obj = BTreeMap::new();
        obj.insert("s".to_string(), WireValue::Stream(Placeholder::new("id1", None)));
        obj.insert("b".to_string(), WireValue::Bytes(vec![1, 2, 255]));
        let wire = WireValue::Array(vec![WireValue::Undefined, WireValue::Object(obj), WireValue::from("x")]);

        let via_serde = serde_json::to_value(&wire).unwrap();
        assert_eq!(via_serde, wire.to_json());
        assert_eq!(via_serde, json!([null, { "b": [1, 2, 255], "s": { "$stream": "id1" } }, "x"]));
    }

    #[test]
    fn test_placeholder_json_roundtrip_keeps_options() {
        let options = StreamOptions::default()
            .with_high_water_mark(10)
            .with_object_mode(true)
            .with_allow_half_open(true);
        let placeholder = Placeholder::new("xyz", Some(options));
        let back = WireValue::from(placeholder.to_json());
        assert_eq!(back, WireValue::Stream(placeholder));
    }
}
