//! 多重化器の設定

use evstream_codec::DEFAULT_MAX_DEPTH;
use serde::Deserialize;

/// 多重化器の設定
///
/// 構築時に固定され、その多重化器のすべてのストリームに一律に適用される。
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MultiplexerOptions {
    /// 送信チャンクを常に base64 テキストで送る（バイナリを運べないトランスポート向け）
    pub force_base64: bool,
    /// 引数のネストの上限
    pub max_depth: usize,
}

impl Default for MultiplexerOptions {
    fn default() -> Self {
        MultiplexerOptions {
            force_base64: false,
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_camel_case_with_defaults() {
        let options: MultiplexerOptions = serde_json::from_str(r#"{ "forceBase64": true }"#).unwrap();
        assert!(options.force_base64);
        assert_eq!(options.max_depth, DEFAULT_MAX_DEPTH);

        let options: MultiplexerOptions = serde_json::from_str("{}").unwrap();
        assert_eq!(options, MultiplexerOptions::default());
    }
}
