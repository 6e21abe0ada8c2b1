//! チャンクとそのワイヤ上の符号化
//!
//! ## 送信時
//!
//! ```text
//! Bytes  → (Bytes, "buffer")            通常
//! Bytes  → (String(base64), "base64")   forceBase64 のとき
//! Object → (JSON 値そのまま, "buffer")  要素モード
//! ```
//!
//! ## 受信時（バイトモード）
//!
//! Bytes / base64 文字列 / utf8 文字列 / null / octet 配列をすべてバイト列に正規化する。
//! octet 配列は、バイナリを運べない JSON トランスポートを経由したバイナリ。

use base64::Engine as _;
use serde_json::Value as Json;

use crate::error::WireError;
use crate::value::WireValue;

/// ストリームを流れる 1 単位のデータ
#[derive(Debug, Clone, PartialEq)]
pub enum Chunk {
    /// バイトモードのデータ
    Bytes(Vec<u8>),
    /// 要素モードのデータ（任意の JSON 値）
    Object(Json),
}

/// チャンクのワイヤ上の符号化
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Encoding {
    /// 生バイナリ
    #[default]
    Buffer,
    /// base64 テキスト
    Base64,
    /// UTF-8 テキスト
    Utf8,
}

impl Encoding {
    pub fn as_str(&self) -> &'static str {
        match self {
            Encoding::Buffer => "buffer",
            Encoding::Base64 => "base64",
            Encoding::Utf8 => "utf8",
        }
    }

    /// ワイヤ上の名前から解釈する。未知の名前は `None`
    pub fn from_wire(name: &str) -> Option<Self> {
        match name {
            "buffer" => Some(Encoding::Buffer),
            "base64" => Some(Encoding::Base64),
            "utf8" | "utf-8" => Some(Encoding::Utf8),
            _ => None,
        }
    }
}

impl Chunk {
    /// バックプレッシャー計算に使う量（バイト数、要素モードでは 1）
    pub fn units(&self) -> usize {
        match self {
            Chunk::Bytes(b) => b.len(),
            Chunk::Object(_) => 1,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Chunk::Bytes(b) => Some(b),
            Chunk::Object(_) => None,
        }
    }

    pub fn is_object(&self) -> bool {
        matches!(self, Chunk::Object(_))
    }

    /// 送信用のワイヤ値と符号化を決める
    pub fn into_wire(self, force_base64: bool) -> (WireValue, Encoding) {
        match self {
            Chunk::Bytes(bytes) if force_base64 => (
                WireValue::String(base64::engine::general_purpose::STANDARD.encode(bytes)),
                Encoding::Base64,
            ),
            Chunk::Bytes(bytes) => (WireValue::Bytes(bytes), Encoding::Buffer),
            Chunk::Object(json) => (WireValue::from(json), Encoding::Buffer),
        }
    }

    /// 受信したワイヤ値をチャンクに戻す
    ///
    /// # エラー
    /// - `WireError::InvalidBase64`: base64 として宣言された文字列が不正
    /// - `WireError::InvalidChunk`: バイト列に変換できない形
    pub fn from_wire(value: WireValue, encoding: Encoding, object_mode: bool) -> Result<Self, WireError> {
        if object_mode {
            return Ok(match value {
                WireValue::Bytes(bytes) => Chunk::Bytes(bytes),
                other => Chunk::Object(other.to_json()),
            });
        }

        match value {
            WireValue::Bytes(bytes) => Ok(Chunk::Bytes(bytes)),
            WireValue::Null | WireValue::Undefined => Ok(Chunk::Bytes(Vec::new())),
            WireValue::String(text) => match encoding {
                Encoding::Base64 => base64::engine::general_purpose::STANDARD
                    .decode(text.as_bytes())
                    .map(Chunk::Bytes)
                    .map_err(|e| WireError::InvalidBase64(e.to_string())),
                Encoding::Buffer | Encoding::Utf8 => Ok(Chunk::Bytes(text.into_bytes())),
            },
            WireValue::Array(items) => items
                .iter()
                .map(|item| {
                    item.as_u64()
                        .and_then(|n| u8::try_from(n).ok())
                        .ok_or(WireError::InvalidChunk("array element is not an octet"))
                })
                .collect::<Result<Vec<u8>, _>>()
                .map(Chunk::Bytes),
            _ => Err(WireError::InvalidChunk("unsupported chunk type")),
        }
    }
}

impl From<Vec<u8>> for Chunk {
    fn from(bytes: Vec<u8>) -> Self {
        Chunk::Bytes(bytes)
    }
}

impl From<&[u8]> for Chunk {
    fn from(bytes: &[u8]) -> Self {
        Chunk::Bytes(bytes.to_vec())
    }
}

impl From<&str> for Chunk {
    fn from(text: &str) -> Self {
        Chunk::Bytes(text.as_bytes().to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_bytes_by_default() {
        let (wire, enc) = Chunk::from(&b"hello"[..]).into_wire(false);
        assert_eq!(wire, WireValue::Bytes(b"hello".to_vec()));
        assert_eq!(enc, Encoding::Buffer);
    }

    #[test]
    fn test_force_base64() {
        let (wire, enc) = Chunk::from(&b"hello"[..]).into_wire(true);
        assert_eq!(wire, WireValue::String("aGVsbG8=".to_string()));
        assert_eq!(enc, Encoding::Base64);

        let back = Chunk::from_wire(wire, enc, false).unwrap();
        assert_eq!(back, Chunk::Bytes(b"hello".to_vec()));
    }

    #[test]
    fn test_invalid_base64_rejected() {
        let result = Chunk::from_wire(WireValue::from("***"), Encoding::Base64, false);
        assert!(matches!(result, Err(WireError::InvalidBase64(_))));
    }

    #[test]
    fn test_octet_array_normalized() {
        // JSON トランスポートを経由したバイナリ
        let wire = WireValue::from(serde_json::json!([104, 105]));
        let chunk = Chunk::from_wire(wire, Encoding::Buffer, false).unwrap();
        assert_eq!(chunk, Chunk::Bytes(b"hi".to_vec()));

        let wire = WireValue::from(serde_json::json!([1, 300]));
        assert!(Chunk::from_wire(wire, Encoding::Buffer, false).is_err());
    }

    #[test]
    fn test_null_chunk_is_empty() {
        let chunk = Chunk::from_wire(WireValue::Null, Encoding::Buffer, false).unwrap();
        assert_eq!(chunk, Chunk::Bytes(Vec::new()));
    }

    #[test]
    fn test_object_mode_passes_values() {
        let wire = WireValue::from(serde_json::json!({ "row": 1 }));
        let chunk = Chunk::from_wire(wire, Encoding::Buffer, true).unwrap();
        assert_eq!(chunk, Chunk::Object(serde_json::json!({ "row": 1 })));
        assert_eq!(chunk.units(), 1);
    }

    #[test]
    fn test_encoding_names() {
        for enc in [Encoding::Buffer, Encoding::Base64, Encoding::Utf8] {
            assert_eq!(Encoding::from_wire(enc.as_str()), Some(enc));
        }
        assert_eq!(Encoding::from_wire("hex"), None);
    }
}
