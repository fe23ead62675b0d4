//! 時系列記録
//!
//! 統計集計や報告は外部コンポーネントの責務。コアが依存するのは
//! 「純粋な `add(value, time)`」だけで、それを [`Recorder`] として切り出す。
//! 付属の [`Trace`] は生サンプルを貯めるだけの最小実装で、資源の
//! `history` API とテストがこれを使う。

use serde::Serialize;

/// 1 サンプル
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Sample {
    /// シミュレーション時刻
    pub time: f64,
    /// 記録値（資源なら使用量・水位）
    pub value: f64,
}

/// 時系列レコーダ
pub trait Recorder {
    /// 観測値を追加する。副作用はレコーダ自身の状態更新のみ。
    fn add(&mut self, value: f64, time: f64);
}

/// 生サンプルをそのまま保持するレコーダ
#[derive(Debug, Clone, Default)]
pub struct Trace {
    samples: Vec<Sample>,
}

impl Trace {
    /// 空のトレースを生成
    pub fn new() -> Self {
        Self { samples: Vec::new() }
    }

    /// 記録済みサンプル
    #[inline]
    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    /// サンプル数
    #[inline]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// 空かどうか
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// 最後のサンプル
    #[inline]
    pub fn last(&self) -> Option<Sample> {
        self.samples.last().copied()
    }
}

impl Recorder for Trace {
    fn add(&mut self, value: f64, time: f64) {
        self.samples.push(Sample { time, value });
    }
}
