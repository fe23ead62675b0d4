//! ハンドル（Handle）
//!
//! 優先度付きキューが enqueue 時に発行する 64bit 識別子。
//! 同一キュー内で単調増加し、一度発行された値は再利用されない。
//! 値 0 は「なし」を表す予約値。

/// キューエントリの安定識別子
///
/// キャンセル・再優先度付け・O(1) 参照はすべてこの値を鍵に行う。
/// エントリが dequeue / cancel で消えた後も値そのものは無効になるだけで、
/// 後続のエントリに割り当て直されることはない。
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct Handle(u64);

impl Handle {
    /// 予約値「なし」
    pub const NONE: Handle = Handle(0);

    /// 生の値から生成
    #[inline]
    pub const fn new(v: u64) -> Handle {
        Handle(v)
    }

    /// 生の値を取得
    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// 有効なハンドルかどうか
    #[inline]
    pub const fn is_some(self) -> bool {
        self.0 != 0
    }

    /// 「なし」かどうか
    #[inline]
    pub const fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl Default for Handle {
    fn default() -> Self {
        Handle::NONE
    }
}

impl std::fmt::Display for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}
