//! 条件変数
//!
//! 状態を持たない guard。待機者ごとにユーザー述語を預かり、signal で
//! 全待機者の述語を評価して成立した者を全員起こす（唯一の全員覚醒）。
//! 覚醒はイベント経由なので、起きた時点で述語が崩れていることもある。
//! 待機者は必ず自分の述語を再検査すること（spurious wakeup 規律）。
//!
//! observer 登録と組み合わせると、複数の pool / buffer の状態変化を
//! 1 つの条件変数で監視できる。

use crate::resource::{
    ConditionId, ConditionState, Demand, GuardId, Resource, ResourceKind, clamp_name, new_guard,
    next_resource_id,
};
use crate::sim::Sim;
use crate::types::Signal;

impl Sim {
    /// 条件変数を生成する
    pub fn create_condition(&self, name: &str) -> ConditionId {
        let mut borrow = self.inst_mut();
        let inst = &mut *borrow;
        let rid = next_resource_id(inst);
        let guard = new_guard(inst, rid);
        let key = inst.resources.insert(Resource {
            name: clamp_name(name),
            kind: ResourceKind::Condition(ConditionState { guard, preds: slab::Slab::new() }),
        });
        debug_assert_eq!(key, rid.index());
        ConditionId(rid)
    }

    /// 述語が成立するまで待つ
    ///
    /// 述語は純粋であること（シミュレーション操作を呼ばない）。
    /// 覚醒シグナルをそのまま返す。SUCCESS でも呼び出し側は自分の
    /// 条件を再検査してから進むのが作法。
    pub fn condition_wait<F>(&self, condition: ConditionId, pred: F) -> Signal
    where
        F: FnMut() -> bool + 'static,
    {
        let rid = condition.0;
        let (guard, key) = {
            let mut borrow = self.inst_mut();
            let inst = &mut *borrow;
            let cond = inst.resources[rid.index()].condition_mut();
            let key = cond.preds.insert(Some(Box::new(pred)));
            (cond.guard, key)
        };
        let signal = self.guard_wait(guard, Demand::Predicate(key));
        let mut borrow = self.inst_mut();
        let inst = &mut *borrow;
        if let Some(res) = inst.resources.get_mut(rid.index()) {
            res.condition_mut().preds.try_remove(key);
        }
        signal
    }

    /// 条件変数へ signal する
    ///
    /// 全待機者の述語を評価し、成立した者全員に覚醒イベントを積む。
    /// 誰かを起こしたら true。
    pub fn condition_signal(&self, condition: ConditionId) -> bool {
        let guard = self.condition_guard(condition);
        self.guard_signal(guard)
    }

    /// 条件変数の guard（observer 登録に使う）
    pub fn condition_guard(&self, condition: ConditionId) -> GuardId {
        self.inst().resources[condition.0.index()].condition_guard()
    }

    /// 条件変数を撤去する。待機者は CANCELLED で追い出される。
    pub fn destroy_condition(&self, condition: ConditionId) {
        let guard = self.condition_guard(condition);
        crate::resource::teardown_guard(self, guard);
        self.inst_mut().resources.remove(condition.0.index());
    }
}

impl Resource {
    pub(crate) fn condition_guard(&self) -> GuardId {
        match &self.kind {
            ResourceKind::Condition(s) => s.guard,
            _ => panic!("resource `{}` is not a condition", self.name),
        }
    }
}
