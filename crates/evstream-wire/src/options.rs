//! ストリームのバッファリング設定
//!
//! 設定はバインド時にプレースホルダに載せてそのまま相手に渡す。
//! 両端で同じ閾値が使われるので、バックプレッシャーの挙動が対称になる。

use serde::{Deserialize, Serialize};

/// バイトモードのデフォルト閾値（バイト）
pub const DEFAULT_HIGH_WATER_MARK: usize = 16 * 1024;

/// 要素モードのデフォルト閾値（要素数）
pub const DEFAULT_OBJECT_HIGH_WATER_MARK: usize = 16;

/// ストリームのバッファリング設定
///
/// 未設定のフィールドはワイヤに載らない。相手側でも未設定のまま復元される。
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamOptions {
    /// バックプレッシャーの閾値（バイト数、要素モードでは要素数）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub high_water_mark: Option<usize>,
    /// 要素モード（チャンクを任意の JSON 値として扱う）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub object_mode: Option<bool>,
    /// 片側だけ閉じた状態を許可するか
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allow_half_open: Option<bool>,
}

impl StreamOptions {
    pub fn with_high_water_mark(mut self, hwm: usize) -> Self {
        self.high_water_mark = Some(hwm);
        self
    }

    pub fn with_object_mode(mut self, object_mode: bool) -> Self {
        self.object_mode = Some(object_mode);
        self
    }

    pub fn with_allow_half_open(mut self, allow: bool) -> Self {
        self.allow_half_open = Some(allow);
        self
    }

    pub fn is_object_mode(&self) -> bool {
        self.object_mode.unwrap_or(false)
    }

    pub fn allows_half_open(&self) -> bool {
        self.allow_half_open.unwrap_or(false)
    }

    /// 実効閾値
    pub fn effective_high_water_mark(&self) -> usize {
        match self.high_water_mark {
            Some(hwm) => hwm,
            None if self.is_object_mode() => DEFAULT_OBJECT_HIGH_WATER_MARK,
            None => DEFAULT_HIGH_WATER_MARK,
        }
    }
}
