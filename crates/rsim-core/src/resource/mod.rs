//! 資源
//!
//! 待機可能な資源の共通基盤と変種（binary / pool / buffer / condition）。
//! 各資源は guard（優先度順の待合室）を 1〜2 個持ち、状態変化のたびに
//! guard へ signal を送って先頭待機者の要求述語を評価させる。
//!
//! # 多相性
//!
//! C 流のポインタ多相は閉じた enum（`ResourceKind`）の match 分岐で表す。
//! 初期化前使用は arena 生成の型構造上あり得ないため、validity cookie は
//! 存在しない。種別違いの操作（pool API を buffer に使う等）は契約違反
//! として即 panic する。

mod binary;
mod buffer;
mod condition;
mod guard;
mod pool;

#[cfg(test)]
mod tests;

pub use guard::{Guard, WaiterRec};
pub(crate) use pool::record_pool;

use slab::Slab;

use crate::pqueue::PrioQueue;
use crate::process::{HeldResource, ProcessId};
use crate::recording::Trace;
use crate::sim::{Instance, Sim};
use crate::types::Handle;

/// 資源識別子（arena 添字）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceId(usize);

impl ResourceId {
    #[inline]
    pub(crate) fn new(index: usize) -> Self {
        Self(index)
    }

    #[inline]
    pub(crate) fn index(self) -> usize {
        self.0
    }
}

/// guard 識別子（arena 添字）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GuardId(usize);

impl GuardId {
    #[inline]
    pub(crate) fn new(index: usize) -> Self {
        Self(index)
    }

    #[inline]
    pub(crate) fn index(self) -> usize {
        self.0
    }
}

/// 相互排除資源の識別子
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BinaryId(pub(crate) ResourceId);

/// 計数 pool の識別子
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PoolId(pub(crate) ResourceId);

/// 両端 buffer の識別子
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferId(pub(crate) ResourceId);

/// 条件変数の識別子
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConditionId(pub(crate) ResourceId);

/// 要求述語
///
/// guard が待機者を通すかどうかの判定。C の関数ポインタ + ctx を
/// 閉じた enum に置き換えたもの。`Predicate` は条件変数が slab に
/// 預かるユーザー述語への鍵。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Demand {
    /// binary: 保持者がいない
    SlotFree,
    /// pool: 1 単位以上の空きがある
    PoolAvailable,
    /// buffer 消費側: 水位が 0 より大きい
    NonEmpty,
    /// buffer 生産側: 水位が容量未満
    NotFull,
    /// 条件変数: ユーザー述語
    Predicate(usize),
}

/// pool の保持レコード（holders キューのペイロード）
#[derive(Debug, Clone, Copy)]
pub(crate) struct HolderRec {
    pub process: ProcessId,
    pub amount: u64,
}

pub(crate) struct BinaryState {
    pub guard: GuardId,
    pub holder: Option<ProcessId>,
}

pub(crate) struct PoolState {
    pub guard: GuardId,
    pub capacity: u64,
    pub in_use: u64,
    /// 横取り犠牲者順（優先度昇順・後着優先）の保持者キュー
    pub holders: PrioQueue<HolderRec>,
    pub trace: Option<Trace>,
}

pub(crate) struct BufferState {
    /// 消費側（get）の待合室
    pub front: GuardId,
    /// 生産側（put）の待合室
    pub rear: GuardId,
    pub capacity: u64,
    pub level: u64,
    pub trace: Option<Trace>,
}

pub(crate) struct ConditionState {
    pub guard: GuardId,
    /// 待機中のユーザー述語。評価中は一時的に取り出すため Option。
    pub preds: Slab<Option<Box<dyn FnMut() -> bool>>>,
}

pub(crate) enum ResourceKind {
    Binary(BinaryState),
    Pool(PoolState),
    Buffer(BufferState),
    Condition(ConditionState),
}

pub(crate) struct Resource {
    pub name: String,
    pub kind: ResourceKind,
}

impl Resource {
    pub fn binary(&self) -> &BinaryState {
        match &self.kind {
            ResourceKind::Binary(s) => s,
            _ => panic!("resource `{}` is not a binary resource", self.name),
        }
    }

    pub fn binary_mut(&mut self) -> &mut BinaryState {
        match &mut self.kind {
            ResourceKind::Binary(s) => s,
            _ => panic!("resource `{}` is not a binary resource", self.name),
        }
    }

    pub fn pool(&self) -> &PoolState {
        match &self.kind {
            ResourceKind::Pool(s) => s,
            _ => panic!("resource `{}` is not a pool", self.name),
        }
    }

    pub fn pool_mut(&mut self) -> &mut PoolState {
        match &mut self.kind {
            ResourceKind::Pool(s) => s,
            _ => panic!("resource `{}` is not a pool", self.name),
        }
    }

    pub fn buffer(&self) -> &BufferState {
        match &self.kind {
            ResourceKind::Buffer(s) => s,
            _ => panic!("resource `{}` is not a buffer", self.name),
        }
    }

    pub fn buffer_mut(&mut self) -> &mut BufferState {
        match &mut self.kind {
            ResourceKind::Buffer(s) => s,
            _ => panic!("resource `{}` is not a buffer", self.name),
        }
    }

    pub fn condition_mut(&mut self) -> &mut ConditionState {
        match &mut self.kind {
            ResourceKind::Condition(s) => s,
            _ => panic!("resource `{}` is not a condition", self.name),
        }
    }
}

impl Sim {
    /// 強制返却（exit / stop の保持資源解消）
    ///
    /// 保持者の記録を資源側から消し、空いた分を guard に知らせる。
    pub(crate) fn drop_held(&self, pid: ProcessId, hr: HeldResource) {
        let signal_guard = {
            let mut borrow = self.inst_mut();
            let inst = &mut *borrow;
            let Some(res) = inst.resources.get_mut(hr.resource.index()) else {
                return;
            };
            match &mut res.kind {
                ResourceKind::Binary(b) => {
                    if b.holder == Some(pid) {
                        b.holder = None;
                        Some(b.guard)
                    } else {
                        None
                    }
                }
                ResourceKind::Pool(p) => {
                    let amount = p.holders.get(hr.holder).map_or(0, |t| t.payload.amount);
                    if p.holders.cancel(hr.holder) {
                        p.in_use -= amount;
                        let now = inst.calendar.now();
                        record_pool(p, now);
                        Some(p.guard)
                    } else {
                        None
                    }
                }
                ResourceKind::Buffer(_) | ResourceKind::Condition(_) => None,
            }
        };
        if let Some(g) = signal_guard {
            self.guard_signal(g);
        }
    }
}

/// set_priority に伴う pool 保持レコードの並び直し
pub(crate) fn reprioritize_holder(
    inst: &mut Instance,
    hr: HeldResource,
    priority: i64,
    pid: ProcessId,
) {
    if let Some(res) = inst.resources.get_mut(hr.resource.index())
        && let ResourceKind::Pool(p) = &mut res.kind
    {
        p.holders.reprioritize(hr.holder, 0.0, priority, pid.raw());
    }
}

/// 資源名の切り詰め（プロセス名と同じ 32 文字上限）
pub(crate) fn clamp_name(name: &str) -> String {
    name.chars().take(crate::process::NAME_CAP).collect()
}

/// guard を arena に生やす
pub(crate) fn new_guard(inst: &mut Instance, target: ResourceId) -> GuardId {
    use crate::pqueue::waiting_order;
    GuardId::new(inst.guards.insert(Guard {
        queue: PrioQueue::new(waiting_order::<WaiterRec>),
        target,
        observers: smallvec::SmallVec::new(),
    }))
}

/// 資源 arena の次の添字（guard との相互参照を先に張るため）
pub(crate) fn next_resource_id(inst: &Instance) -> ResourceId {
    ResourceId::new(inst.resources.vacant_key())
}

/// 待機者全員を CANCELLED で追い出して guard を撤去する
pub(crate) fn teardown_guard(sim: &Sim, guard_id: GuardId) {
    let mut borrow = sim.inst_mut();
    let inst = &mut *borrow;
    let Some(g) = inst.guards.try_remove(guard_id.index()) else {
        return;
    };
    for tag in g.queue.iter() {
        let w = tag.payload;
        if let Some(rec) = inst.processes.get_mut(w.process.index())
            && let Some(at) = rec.awaits.iter().position(
                |a| matches!(a, crate::process::Awaitable::Resource { guard: gg, .. } if *gg == guard_id),
            )
        {
            rec.awaits.swap_remove(at);
        }
        crate::sim::schedule_wake(inst, w.process, crate::types::Signal::CANCELLED);
    }
    for (_, other) in inst.guards.iter_mut() {
        if let Some(at) = other.observers.iter().position(|o| *o == guard_id) {
            other.observers.swap_remove(at);
        }
    }
}

/// HeldResource の `holder == NONE`（binary）用の生成補助
pub(crate) fn held_binary(resource: ResourceId) -> HeldResource {
    HeldResource { resource, holder: Handle::NONE }
}
