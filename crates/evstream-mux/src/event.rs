//! イベント名の分類
//!
//! 予約イベントはコーデックを通らず、ローカルの観測者にそのまま届く。
//! それ以外はすべてストリームイベントとしてトランスポートに流れる。

/// 予約イベント
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReservedEvent {
    /// トランスポートの障害など
    Error,
    /// リスナーが追加された（引数: イベント名）
    NewListener,
    /// リスナーが外された（引数: イベント名）
    RemoveListener,
}

impl ReservedEvent {
    pub const ALL: [ReservedEvent; 3] = [
        ReservedEvent::Error,
        ReservedEvent::NewListener,
        ReservedEvent::RemoveListener,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ReservedEvent::Error => "error",
            ReservedEvent::NewListener => "newListener",
            ReservedEvent::RemoveListener => "removeListener",
        }
    }
}

/// イベント名の種類
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind<'a> {
    Reserved(ReservedEvent),
    Stream(&'a str),
}

impl<'a> EventKind<'a> {
    pub fn classify(name: &'a str) -> Self {
        ReservedEvent::ALL
            .into_iter()
            .find(|r| r.name() == name)
            .map_or(EventKind::Stream(name), EventKind::Reserved)
    }

    pub fn is_reserved(&self) -> bool {
        matches!(self, EventKind::Reserved(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify() {
        assert_eq!(EventKind::classify("error"), EventKind::Reserved(ReservedEvent::Error));
        assert_eq!(
            EventKind::classify("newListener"),
            EventKind::Reserved(ReservedEvent::NewListener)
        );
        assert_eq!(
            EventKind::classify("removeListener"),
            EventKind::Reserved(ReservedEvent::RemoveListener)
        );
        assert_eq!(EventKind::classify("upload"), EventKind::Stream("upload"));
        // 大文字小文字は区別する
        assert!(!EventKind::classify("Error").is_reserved());
    }
}
