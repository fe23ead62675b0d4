//! rsim-core: プロセス指向の離散事象シミュレーションコア
//!
//! 単一スレッド・協調スケジューリングで、名前付きプロセスを仮想時計に
//! 沿って駆動するシミュレーションエンジンの中核ライブラリ。
//!
//! # 構成
//!
//! - `pqueue`: heap + hash の優先度付きキュー（カレンダーと待ち行列の基盤）
//! - `coroutine`: stackful 協調コルーチンランタイム
//! - `calendar`: シミュレーション時計とイベントカレンダー
//! - `process`: プロセスのライフサイクルと待機・割り込み
//! - `resource`: 待機可能な資源（binary / pool / buffer / condition）
//! - `recording`: 時系列記録の最小インターフェース
//!
//! # 実行モデル
//!
//! 1 インスタンス = 1 カレンダー + 1 時計 + プロセス群 + 資源群。
//! インスタンス内は単一スレッド協調で、中断は hold / wait / acquire 系の
//! 明示的な操作だけ。覚醒は必ずカレンダーのイベントとして積まれ、
//! (時刻, 優先度, FIFO) の全順序で他のイベントと競合する。同一シードなら
//! 実行は決定的。
//!
//! # 例
//!
//! ```
//! use rsim_core::Sim;
//!
//! let sim = Sim::new();
//! let p = sim.spawn("worker", 0, |sim| {
//!     sim.hold(1.0);
//!     42
//! });
//! sim.start(p);
//! sim.run();
//! assert_eq!(sim.now(), 1.0);
//! assert_eq!(sim.exit_value(p), 42);
//! ```

pub mod calendar;
pub mod coroutine;
pub mod pqueue;
pub mod process;
pub mod recording;
pub mod resource;
pub mod sim;
pub mod types;

pub use calendar::{EventFn, EventPattern, Match};
pub use process::{ProcessId, ProcessStatus};
pub use recording::{Recorder, Sample, Trace};
pub use resource::{BinaryId, BufferId, ConditionId, GuardId, PoolId};
pub use sim::Sim;
pub use types::{Handle, Signal};
