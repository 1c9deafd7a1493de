//! スレッド識別子

use std::fmt;

/// デバッグ対象スレッドの識別子
///
/// ネイティブバックエンドではLWPのTID、エンジンバックエンドではエンジンが報告する
/// スレッドIDを保持します。プロセスが生存している間のみ有効です。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThreadHandle(u64);

impl ThreadHandle {
    /// スレッドIDからハンドルを作成する
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// 生のスレッドIDを取得する
    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ThreadHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
