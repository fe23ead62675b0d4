//! シグナル（Signal）
//!
//! 中断点から再開されたプロセスに「なぜ起こされたか」を伝える i64 値。
//! `SUCCESS` (= 0) は正常完了、負の予約値はライブラリが使う協調シグナル、
//! 正の値はユーザー定義の割り込みシグナル。
//!
//! シグナルはエラーではない。hold / wait / acquire 系の戻り値として
//! 同期的に呼び出し元へ流れ、キューに積まれることはない。

use serde::Serialize;

/// 再開理由
///
/// 予約値は `Value` 同様の const 群で公開する。ユーザーシグナルは
/// [`Signal::user`] で作り、予約領域（0 以下）とは重ならない。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[repr(transparent)]
pub struct Signal(i64);

impl Signal {
    /// 正常完了（待っていた事象がそのまま成立した）
    pub const SUCCESS: Signal = Signal(0);
    /// 待機対象が取り消された（イベント cancel / guard cancel）
    pub const CANCELLED: Signal = Signal(-1);
    /// 待機対象のプロセスが外部から stop された
    pub const STOPPED: Signal = Signal(-2);
    /// 保持していた資源を高優先度プロセスに横取りされた
    pub const PREEMPTED: Signal = Signal(-3);

    /// ユーザー定義シグナルを生成
    ///
    /// 正の値のみ許す。0 と予約値の衝突は契約違反として即 panic する。
    #[inline]
    pub fn user(raw: i64) -> Signal {
        assert!(raw > 0, "user signal must be positive, got {raw}");
        Signal(raw)
    }

    /// 生の値から復元（キュー経由の往復用）
    #[inline]
    pub(crate) const fn from_raw(raw: i64) -> Signal {
        Signal(raw)
    }

    /// 生の値を取得
    #[inline]
    pub const fn raw(self) -> i64 {
        self.0
    }

    /// 正常完了かどうか
    #[inline]
    pub const fn is_success(self) -> bool {
        self.0 == 0
    }

    /// ライブラリ予約シグナルかどうか
    #[inline]
    pub const fn is_reserved(self) -> bool {
        self.0 <= 0
    }
}

impl Default for Signal {
    fn default() -> Self {
        Signal::SUCCESS
    }
}

impl std::fmt::Display for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            Signal::SUCCESS => write!(f, "SUCCESS"),
            Signal::CANCELLED => write!(f, "CANCELLED"),
            Signal::STOPPED => write!(f, "STOPPED"),
            Signal::PREEMPTED => write!(f, "PREEMPTED"),
            Signal(v) => write!(f, "USER({v})"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserved_signals_are_distinct() {
        let all = [Signal::SUCCESS, Signal::CANCELLED, Signal::STOPPED, Signal::PREEMPTED];
        for (i, a) in all.iter().enumerate() {
            for b in &all[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn test_user_signal_positive() {
        let s = Signal::user(7);
        assert!(!s.is_success());
        assert!(!s.is_reserved());
        assert_eq!(s.raw(), 7);
    }

    #[test]
    #[should_panic(expected = "user signal must be positive")]
    fn test_user_signal_rejects_reserved_range() {
        let _ = Signal::user(-1);
    }
}
