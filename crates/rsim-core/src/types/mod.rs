//! 基本型
//!
//! シミュレーション全体で共有する値型。
//! - `Handle`: 優先度付きキューが発行する安定識別子
//! - `Signal`: 再開理由を運ぶシグナル値

mod handle;
mod signal;

pub use handle::Handle;
pub use signal::Signal;
