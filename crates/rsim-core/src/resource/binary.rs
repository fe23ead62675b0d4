//! binary 資源（相互排除）
//!
//! 保持者スロット 1 個と guard。保持者自身の再獲得と非保持者からの
//! 返却は契約違反として即 panic する。

use crate::process::ProcessId;
use crate::resource::{
    BinaryId, BinaryState, Demand, GuardId, Resource, ResourceKind, clamp_name, held_binary,
    new_guard, next_resource_id,
};
use crate::sim::Sim;
use crate::types::Signal;

impl Sim {
    /// binary 資源を生成する
    pub fn create_resource(&self, name: &str) -> BinaryId {
        let mut borrow = self.inst_mut();
        let inst = &mut *borrow;
        let rid = next_resource_id(inst);
        let guard = new_guard(inst, rid);
        let key = inst.resources.insert(Resource {
            name: clamp_name(name),
            kind: ResourceKind::Binary(BinaryState { guard, holder: None }),
        });
        debug_assert_eq!(key, rid.index());
        BinaryId(rid)
    }

    /// 資源を獲得する
    ///
    /// 空くまで guard で待つ。割り込みならそのシグナルが返る。
    pub fn resource_acquire(&self, resource: BinaryId) -> Signal {
        let pid = self.expect_current("acquire");
        let rid = resource.0;
        let guard = self.inst().resources[rid.index()].binary().guard;
        loop {
            let acquired = {
                let mut borrow = self.inst_mut();
                let inst = &mut *borrow;
                let b = inst.resources[rid.index()].binary_mut();
                match b.holder {
                    Some(holder) => {
                        assert_ne!(holder, pid, "acquire of a resource already held by the caller");
                        false
                    }
                    None => {
                        b.holder = Some(pid);
                        inst.processes[pid.index()].resources.push(held_binary(rid));
                        true
                    }
                }
            };
            if acquired {
                return Signal::SUCCESS;
            }
            let signal = self.guard_wait(guard, Demand::SlotFree);
            if !signal.is_success() {
                return signal;
            }
        }
    }

    /// 資源を返却して guard へ signal する
    ///
    /// 事前条件: 呼び出しプロセスが保持者であること。
    pub fn resource_release(&self, resource: BinaryId) {
        let pid = self.expect_current("release");
        let rid = resource.0;
        let guard = {
            let mut borrow = self.inst_mut();
            let inst = &mut *borrow;
            let b = inst.resources[rid.index()].binary_mut();
            assert_eq!(b.holder, Some(pid), "release of a resource held by someone else");
            b.holder = None;
            let rec = &mut inst.processes[pid.index()];
            if let Some(at) = rec.resources.iter().position(|hr| hr.resource == rid) {
                rec.resources.swap_remove(at);
            }
            b.guard
        };
        self.guard_signal(guard);
    }

    /// 現在の保持者
    pub fn resource_holder(&self, resource: BinaryId) -> Option<ProcessId> {
        self.inst().resources[resource.0.index()].binary().holder
    }

    /// binary 資源の guard
    pub fn resource_guard(&self, resource: BinaryId) -> GuardId {
        self.inst().resources[resource.0.index()].binary().guard
    }

    /// binary 資源を撤去する。待機者は CANCELLED で追い出される。
    ///
    /// 事前条件: 保持者がいないこと。
    pub fn destroy_resource(&self, resource: BinaryId) {
        let guard = {
            let inst = self.inst();
            let b = inst.resources[resource.0.index()].binary();
            assert!(b.holder.is_none(), "destroy of a held resource");
            b.guard
        };
        crate::resource::teardown_guard(self, guard);
        self.inst_mut().resources.remove(resource.0.index());
    }
}
