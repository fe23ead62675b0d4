//! 資源 guard（待合室）
//!
//! 優先度降順・同率 FIFO の待ち行列。signal は先頭の要求述語だけを
//! 評価し、満たされれば現在時刻の覚醒イベントを積む。先頭を飛ばして
//! 後続を探すことはしない（飢餓防止の明示的な設計。先頭を追い越したい
//! 側は優先度を上げるのが作法）。
//!
//! 例外は条件変数の guard で、signal が全待機者を走査して述語の成立した
//! 者を全員覚醒させる。覚醒後の再検査（spurious wakeup 規律）は待機者の
//! 責務。
//!
//! observer に登録された guard へは signal が再帰的に転送される。
//! observer グラフの循環回避はアプリケーションの責務。

use smallvec::SmallVec;

use crate::pqueue::PrioQueue;
use crate::process::{Awaitable, ProcessId};
use crate::resource::{Demand, GuardId, ResourceId, ResourceKind};
use crate::sim::{Instance, Sim, schedule_wake};
use crate::types::{Handle, Signal};

/// 待機者エントリ（guard キューのペイロード）
#[derive(Debug, Clone, Copy)]
pub struct WaiterRec {
    pub(crate) process: ProcessId,
    pub(crate) demand: Demand,
}

/// 資源の待合室
pub struct Guard {
    pub(crate) queue: PrioQueue<WaiterRec>,
    pub(crate) target: ResourceId,
    pub(crate) observers: SmallVec<[GuardId; 2]>,
}

impl Sim {
    /// guard で待つ（プロセスコルーチンからのみ）
    ///
    /// 呼び出し元の優先度でエントリを積み、RESOURCE awaitable を記録して
    /// 中断する。SUCCESS 以外で覚醒したら自分のエントリを黙って回収する
    /// （割り込み側が先に消していても冪等）。
    pub(crate) fn guard_wait(&self, guard: GuardId, demand: Demand) -> Signal {
        let pid = self.expect_current("resource wait");
        let entry = {
            let mut borrow = self.inst_mut();
            let inst = &mut *borrow;
            let prio = inst.processes[pid.index()].priority;
            let entry = inst.guards[guard.index()].queue.enqueue(
                WaiterRec { process: pid, demand },
                0.0,
                prio,
                pid.raw(),
            );
            inst.processes[pid.index()].awaits.push(Awaitable::Resource { guard, entry });
            entry
        };
        let signal = Signal::from_raw(crate::coroutine::co_yield());
        {
            let mut borrow = self.inst_mut();
            let inst = &mut *borrow;
            let rec = &mut inst.processes[pid.index()];
            if let Some(at) = rec
                .awaits
                .iter()
                .position(|a| matches!(a, Awaitable::Resource { entry: e, .. } if *e == entry))
            {
                rec.awaits.swap_remove(at);
            }
            if !signal.is_success()
                && let Some(g) = inst.guards.get_mut(guard.index())
            {
                g.queue.cancel(entry);
            }
        }
        signal
    }

    /// guard のベルを鳴らす
    ///
    /// 先頭待機者（条件変数では全待機者）の要求を評価し、満たされた者に
    /// SUCCESS の覚醒イベントを積む。その後 observer へ再帰的に転送する。
    /// 自分または observer の誰かが待機者を起こしたら true。
    pub fn guard_signal(&self, guard: GuardId) -> bool {
        let broadcast = {
            let inst = self.inst();
            let Some(g) = inst.guards.get(guard.index()) else {
                log::warn!("signal of unknown guard {guard:?}");
                return false;
            };
            matches!(
                inst.resources.get(g.target.index()).map(|r| &r.kind),
                Some(ResourceKind::Condition(_))
            )
        };
        let mut resumed =
            if broadcast { self.signal_all(guard) } else { self.signal_front(guard) };
        let observers = {
            let inst = self.inst();
            inst.guards.get(guard.index()).map(|g| g.observers.clone()).unwrap_or_default()
        };
        for o in observers {
            resumed |= self.guard_signal(o);
        }
        resumed
    }

    fn signal_front(&self, guard: GuardId) -> bool {
        let front = {
            let inst = self.inst();
            inst.guards[guard.index()].queue.peek().map(|t| (t.handle, t.payload))
        };
        let Some((entry, w)) = front else {
            return false;
        };
        if !self.demand_met(guard, &w) {
            return false;
        }
        let mut inst = self.inst_mut();
        if inst.guards[guard.index()].queue.cancel(entry) {
            schedule_wake(&mut inst, w.process, Signal::SUCCESS);
            true
        } else {
            false
        }
    }

    /// 条件変数用: 全待機者を走査して成立した者を全員起こす（2 パス）
    fn signal_all(&self, guard: GuardId) -> bool {
        let entries: Vec<(Handle, WaiterRec)> = {
            let inst = self.inst();
            inst.guards[guard.index()].queue.iter().map(|t| (t.handle, t.payload)).collect()
        };
        let mut resumed = false;
        for (entry, w) in entries {
            if self.demand_met(guard, &w) {
                let mut inst = self.inst_mut();
                if inst.guards[guard.index()].queue.cancel(entry) {
                    schedule_wake(&mut inst, w.process, Signal::SUCCESS);
                    resumed = true;
                }
            }
        }
        resumed
    }

    /// 要求述語の評価
    ///
    /// ユーザー述語はインスタンス借用の外で呼ぶため、slab から一時的に
    /// 取り出して呼び、戻す。述語はシミュレーション操作を呼んではならない
    /// （純粋であること）。
    fn demand_met(&self, guard: GuardId, w: &WaiterRec) -> bool {
        let target = self.inst().guards[guard.index()].target;
        match w.demand {
            Demand::SlotFree => self.inst().resources[target.index()].binary().holder.is_none(),
            Demand::PoolAvailable => {
                let inst = self.inst();
                let p = inst.resources[target.index()].pool();
                p.in_use < p.capacity
            }
            Demand::NonEmpty => self.inst().resources[target.index()].buffer().level > 0,
            Demand::NotFull => {
                let inst = self.inst();
                let b = inst.resources[target.index()].buffer();
                b.level < b.capacity
            }
            Demand::Predicate(key) => {
                let taken = {
                    let mut inst = self.inst_mut();
                    let cond = inst.resources[target.index()].condition_mut();
                    cond.preds.get_mut(key).and_then(|slot| slot.take())
                };
                let Some(mut pred) = taken else {
                    debug_assert!(false, "condition predicate missing for key {key}");
                    return false;
                };
                let met = pred();
                let mut inst = self.inst_mut();
                let cond = inst.resources[target.index()].condition_mut();
                if let Some(slot) = cond.preds.get_mut(key) {
                    *slot = Some(pred);
                }
                met
            }
        }
    }

    /// 待機者を取り消して CANCELLED で覚醒させる
    pub fn guard_cancel(&self, guard: GuardId, pid: ProcessId) -> bool {
        let mut inst = self.inst_mut();
        if remove_waiter_entry(&mut inst, guard, pid) {
            schedule_wake(&mut inst, pid, Signal::CANCELLED);
            true
        } else {
            drop(inst);
            log::warn!("guard cancel: {pid:?} is not waiting");
            false
        }
    }

    /// 待機者を黙って外す（覚醒なし。後始末は呼び出し側の責務）
    pub fn guard_remove(&self, guard: GuardId, pid: ProcessId) -> bool {
        let mut inst = self.inst_mut();
        let removed = remove_waiter_entry(&mut inst, guard, pid);
        if !removed {
            drop(inst);
            log::warn!("guard remove: {pid:?} is not waiting");
        }
        removed
    }

    /// observer を登録する（signal の転送先になる）
    pub fn register_observer(&self, guard: GuardId, observer: GuardId) {
        assert_ne!(guard, observer, "a guard cannot observe itself");
        let mut inst = self.inst_mut();
        let g = &mut inst.guards[guard.index()];
        if !g.observers.contains(&observer) {
            g.observers.push(observer);
        }
    }

    /// observer 登録を解除する
    pub fn unregister_observer(&self, guard: GuardId, observer: GuardId) -> bool {
        let mut inst = self.inst_mut();
        let g = &mut inst.guards[guard.index()];
        if let Some(at) = g.observers.iter().position(|o| *o == observer) {
            g.observers.swap_remove(at);
            true
        } else {
            drop(inst);
            log::warn!("unregister_observer: {observer:?} was not observing {guard:?}");
            false
        }
    }
}

/// プロセスの RESOURCE awaitable を基点に、guard キューのエントリと
/// awaitable 記録の両側を外す
fn remove_waiter_entry(inst: &mut Instance, guard: GuardId, pid: ProcessId) -> bool {
    let Some(rec) = inst.processes.get_mut(pid.index()) else {
        return false;
    };
    let Some(at) = rec
        .awaits
        .iter()
        .position(|a| matches!(a, Awaitable::Resource { guard: g, .. } if *g == guard))
    else {
        return false;
    };
    let Awaitable::Resource { entry, .. } = rec.awaits.swap_remove(at) else {
        unreachable!()
    };
    inst.guards[guard.index()].queue.cancel(entry)
}
