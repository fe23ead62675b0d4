//! 優先度付きキュー（heap + hash）
//!
//! イベントカレンダーと資源の待ち行列を支える中核構造。
//!
//! - `HeapTag`: 64バイト相当のエントリ（ハンドル、3つの鍵、ペイロード）
//! - `PrioQueue`: binary min-heap と open-addressing hash の複合体
//! - ハンドルによる O(1) 参照 / O(log n) キャンセル・再優先度付け
//!
//! # ハッシュ方式
//!
//! Fibonacci multiplicative hashing（`handle × ⌊2^64/φ⌋ >> (64 − bits)`）
//! と linear probing。負荷率を live エントリ基準で 50% 未満に保つため、
//! probe 列は短く、必ず空きスロットで停止する。削除は tombstone
//! （heap 参照 0）で遅延し、蓄積したら in-place で再構築する。

mod queue;

#[cfg(test)]
mod tests;

pub use queue::{CompareFn, HeapTag, PrioQueue, calendar_order, victim_order, waiting_order};

/// 初期 heap 容量の指数（容量 8）
pub const INITIAL_HEAP_EXP: u32 = 3;

/// heap 容量の上限指数。`2^31` 超過は致命的エラー。
pub const MAX_HEAP_EXP: u32 = 31;

/// Fibonacci hashing の乗数 ⌊2^64/φ⌋
pub const FIB_MULT: u64 = 0x9E37_79B9_7F4A_7C15;
