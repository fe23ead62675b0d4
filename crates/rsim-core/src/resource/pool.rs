//! 計数 pool（部分保持・横取り付きセマフォ）
//!
//! 獲得は貪欲: 空いている分をその場で取り込み、足りなければ guard で
//! 待って続きを取る。横取り（preempt）は待つ前に、自分より厳密に低い
//! 優先度の保持者を犠牲者順キューの先頭から追い出して保持分を奪う。
//!
//! 不変条件: Σ holder.amount == in_use ≤ capacity。

use crate::process::{HeldResource, ProcessId};
use crate::recording::{Recorder, Sample, Trace};
use crate::resource::{
    Demand, GuardId, HolderRec, PoolId, PoolState, Resource, ResourceId, ResourceKind, clamp_name,
    new_guard, next_resource_id,
};
use crate::sim::{Instance, Sim, interrupt_action};
use crate::types::Signal;

/// 使用量サンプルを記録する（記録中のみ）
pub(crate) fn record_pool(p: &mut PoolState, now: f64) {
    if let Some(trace) = &mut p.trace {
        trace.add(p.in_use as f64, now);
    }
}

/// 保持分を増やす
///
/// 保持レコードが無ければ作り、プロセス側の逆参照も張る。
/// `count` が false のときは in_use を増やさない（犠牲者からの移転分）。
pub(crate) fn credit(inst: &mut Instance, rid: ResourceId, pid: ProcessId, amount: u64, count: bool) {
    let existing =
        inst.processes[pid.index()].resources.iter().find(|hr| hr.resource == rid).map(|hr| hr.holder);
    let prio = inst.processes[pid.index()].priority;
    let now = inst.calendar.now();
    let p = inst.resources[rid.index()].pool_mut();
    match existing {
        Some(holder) => {
            p.holders.payload_mut(holder).expect("holder record missing").amount += amount;
        }
        None => {
            let holder = p.holders.enqueue(HolderRec { process: pid, amount }, 0.0, prio, pid.raw());
            inst.processes[pid.index()].resources.push(HeldResource { resource: rid, holder });
        }
    }
    let p = inst.resources[rid.index()].pool_mut();
    if count {
        p.in_use += amount;
    }
    record_pool(p, now);
}

impl Sim {
    /// pool を生成する
    pub fn create_pool(&self, name: &str, capacity: u64) -> PoolId {
        assert!(capacity > 0, "pool capacity must be positive");
        let mut borrow = self.inst_mut();
        let inst = &mut *borrow;
        let rid = next_resource_id(inst);
        let guard = new_guard(inst, rid);
        let key = inst.resources.insert(Resource {
            name: clamp_name(name),
            kind: ResourceKind::Pool(PoolState {
                guard,
                capacity,
                in_use: 0,
                holders: crate::pqueue::PrioQueue::new(crate::pqueue::victim_order::<HolderRec>),
                trace: None,
            }),
        });
        debug_assert_eq!(key, rid.index());
        PoolId(rid)
    }

    /// `amount` 単位を獲得する（貪欲・部分保持）
    ///
    /// SUCCESS 以外で覚醒したら、入った時点の保持量まで巻き戻して
    /// そのシグナルを返す。
    pub fn pool_acquire(&self, pool: PoolId, amount: u64) -> Signal {
        self.pool_claim(pool, amount, false)
    }

    /// `amount` 単位を横取りで獲得する
    ///
    /// 待つ前に、自分より厳密に低優先度の保持者を犠牲者順に追い出し、
    /// その保持分を奪う。犠牲者には PREEMPTED の割り込みが積まれる。
    /// 自分が待機中に PREEMPTED で起こされたら、より高優先度の横取りに
    /// 敗れたということ。巻き戻して PREEMPTED を返す。
    pub fn pool_preempt(&self, pool: PoolId, amount: u64) -> Signal {
        self.pool_claim(pool, amount, true)
    }

    fn pool_claim(&self, pool: PoolId, amount: u64, preempt: bool) -> Signal {
        let pid = self.expect_current(if preempt { "preempt" } else { "acquire" });
        assert!(amount > 0, "claim of zero units");
        let rid = pool.0;
        let (guard, capacity) = {
            let inst = self.inst();
            let p = inst.resources[rid.index()].pool();
            (p.guard, p.capacity)
        };
        assert!(amount <= capacity, "claim of {amount} units exceeds pool capacity {capacity}");
        let initially_held = self.pool_held_by(pool, pid);
        let mut rem = amount;
        loop {
            // 空き分をその場で取り込む
            let took = {
                let mut borrow = self.inst_mut();
                let inst = &mut *borrow;
                let p = inst.resources[rid.index()].pool_mut();
                let took = rem.min(p.capacity - p.in_use);
                if took > 0 {
                    credit(inst, rid, pid, took, true);
                }
                took
            };
            if took > 0 {
                rem -= took;
                self.guard_signal(guard);
            }
            if rem == 0 {
                return Signal::SUCCESS;
            }
            if preempt {
                rem = self.evict_victims(rid, pid, rem);
                if rem == 0 {
                    return Signal::SUCCESS;
                }
            }
            let signal = self.guard_wait(guard, Demand::PoolAvailable);
            if !signal.is_success() {
                self.pool_unwind(pool, pid, initially_held);
                return signal;
            }
        }
    }

    /// 自分より低優先度の保持者を先頭から追い出して保持分を奪う
    fn evict_victims(&self, rid: ResourceId, pid: ProcessId, mut rem: u64) -> u64 {
        let my_prio = self.inst().processes[pid.index()].priority;
        while rem > 0 {
            let victim = {
                let inst = self.inst();
                let p = inst.resources[rid.index()].pool();
                p.holders.peek().filter(|t| t.ikey < my_prio).map(|t| (t.handle, t.payload))
            };
            let Some((handle, vrec)) = victim else {
                break;
            };
            let mut borrow = self.inst_mut();
            let inst = &mut *borrow;
            let now = inst.calendar.now();
            let p = inst.resources[rid.index()].pool_mut();
            p.holders.cancel(handle);
            let taken = rem.min(vrec.amount);
            let surplus = vrec.amount - taken;
            // 余剰は解放、taken 分は自分へ移転（in_use は据え置き）
            p.in_use -= surplus;
            record_pool(p, now);
            if let Some(vproc) = inst.processes.get_mut(vrec.process.index())
                && let Some(at) = vproc.resources.iter().position(|hr| hr.resource == rid)
            {
                vproc.resources.swap_remove(at);
            }
            credit(inst, rid, pid, taken, false);
            rem -= taken;
            inst.calendar.schedule(
                interrupt_action,
                vrec.process.raw(),
                Signal::PREEMPTED.raw() as u64,
                now,
                my_prio,
            );
        }
        rem
    }

    /// 獲得失敗時の巻き戻し
    fn pool_unwind(&self, pool: PoolId, pid: ProcessId, initially_held: u64) {
        let now_held = self.pool_held_by(pool, pid);
        if now_held > initially_held {
            self.pool_debit(pool.0, pid, now_held - initially_held);
        }
    }

    /// `amount` 単位を返却する
    ///
    /// 事前条件: `amount ≤ 保持量`。全量返却で保持レコードは両側から
    /// 消える。返却後に guard へ signal する。
    pub fn pool_release(&self, pool: PoolId, amount: u64) {
        let pid = self.expect_current("release");
        assert!(amount > 0, "release of zero units");
        self.pool_debit(pool.0, pid, amount);
    }

    fn pool_debit(&self, rid: ResourceId, pid: ProcessId, amount: u64) {
        let guard = {
            let mut borrow = self.inst_mut();
            let inst = &mut *borrow;
            let pos = inst.processes[pid.index()]
                .resources
                .iter()
                .position(|hr| hr.resource == rid)
                .expect("release from a process holding nothing");
            let holder = inst.processes[pid.index()].resources[pos].holder;
            let now = inst.calendar.now();
            let p = inst.resources[rid.index()].pool_mut();
            let held = p.holders.get(holder).expect("holder record missing").payload.amount;
            assert!(amount <= held, "release of {amount} units exceeds held {held}");
            if amount == held {
                p.holders.cancel(holder);
                inst.processes[pid.index()].resources.swap_remove(pos);
            } else {
                p.holders.payload_mut(holder).expect("holder record missing").amount -= amount;
            }
            let p = inst.resources[rid.index()].pool_mut();
            p.in_use -= amount;
            record_pool(p, now);
            p.guard
        };
        self.guard_signal(guard);
    }

    // =========================================================================
    // 照会
    // =========================================================================

    /// 指定プロセスの保持量
    pub fn pool_held_by(&self, pool: PoolId, pid: ProcessId) -> u64 {
        let inst = self.inst();
        let Some(hr) = inst
            .processes
            .get(pid.index())
            .and_then(|r| r.resources.iter().find(|hr| hr.resource == pool.0))
        else {
            return 0;
        };
        inst.resources[pool.0.index()].pool().holders.get(hr.holder).map_or(0, |t| t.payload.amount)
    }

    /// 空き容量
    pub fn pool_available(&self, pool: PoolId) -> u64 {
        let inst = self.inst();
        let p = inst.resources[pool.0.index()].pool();
        p.capacity - p.in_use
    }

    /// 総容量
    pub fn pool_capacity(&self, pool: PoolId) -> u64 {
        self.inst().resources[pool.0.index()].pool().capacity
    }

    /// 使用中の量
    pub fn pool_in_use(&self, pool: PoolId) -> u64 {
        self.inst().resources[pool.0.index()].pool().in_use
    }

    /// 保持者数
    pub fn pool_holder_count(&self, pool: PoolId) -> usize {
        self.inst().resources[pool.0.index()].pool().holders.len()
    }

    /// pool の guard
    pub fn pool_guard(&self, pool: PoolId) -> GuardId {
        self.inst().resources[pool.0.index()].pool().guard
    }

    /// 使用量の記録を開始する（既存の記録は破棄）
    pub fn pool_start_recording(&self, pool: PoolId) {
        let mut borrow = self.inst_mut();
        let inst = &mut *borrow;
        let now = inst.calendar.now();
        let p = inst.resources[pool.0.index()].pool_mut();
        let mut trace = Trace::new();
        trace.add(p.in_use as f64, now);
        p.trace = Some(trace);
    }

    /// 記録を終了し、トレースを引き取る
    pub fn pool_stop_recording(&self, pool: PoolId) -> Option<Trace> {
        self.inst_mut().resources[pool.0.index()].pool_mut().trace.take()
    }

    /// 記録済みサンプルの複製
    pub fn pool_history(&self, pool: PoolId) -> Vec<Sample> {
        self.inst().resources[pool.0.index()]
            .pool()
            .trace
            .as_ref()
            .map(|t| t.samples().to_vec())
            .unwrap_or_default()
    }

    /// pool を撤去する
    ///
    /// 事前条件: 保持者がいないこと。待機者は CANCELLED で追い出される。
    pub fn destroy_pool(&self, pool: PoolId) {
        let guard = {
            let inst = self.inst();
            let p = inst.resources[pool.0.index()].pool();
            assert!(p.holders.is_empty(), "destroy of a pool with holders");
            p.guard
        };
        crate::resource::teardown_guard(self, guard);
        self.inst_mut().resources.remove(pool.0.index());
    }
}
