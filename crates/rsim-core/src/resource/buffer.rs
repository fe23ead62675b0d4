//! 両端 buffer（有界カウンタ）
//!
//! 消費側（get, front guard）と生産側（put, rear guard）が別々の
//! 待合室を持つ。get は `level > 0`、put は `level < capacity` を
//! 要求述語として貪欲に転送し、部分転送のたびに反対側へ signal する。
//!
//! 不変条件: 0 ≤ level ≤ capacity。

use crate::recording::{Recorder, Sample, Trace};
use crate::resource::{
    BufferId, BufferState, Demand, GuardId, Resource, ResourceKind, clamp_name, new_guard,
    next_resource_id,
};
use crate::sim::Sim;
use crate::types::Signal;

fn record_buffer(b: &mut BufferState, now: f64) {
    if let Some(trace) = &mut b.trace {
        trace.add(b.level as f64, now);
    }
}

impl Sim {
    /// buffer を生成する（初期水位 0）
    pub fn create_buffer(&self, name: &str, capacity: u64) -> BufferId {
        assert!(capacity > 0, "buffer capacity must be positive");
        let mut borrow = self.inst_mut();
        let inst = &mut *borrow;
        let rid = next_resource_id(inst);
        let front = new_guard(inst, rid);
        let rear = new_guard(inst, rid);
        let key = inst.resources.insert(Resource {
            name: clamp_name(name),
            kind: ResourceKind::Buffer(BufferState {
                front,
                rear,
                capacity,
                level: 0,
                trace: None,
            }),
        });
        debug_assert_eq!(key, rid.index());
        BufferId(rid)
    }

    /// `*amount` 単位を取り出す（貪欲）
    ///
    /// 戻るとき `*amount` は実際に取り出せた量。SUCCESS なら全量、
    /// 割り込みなら部分転送量とそのシグナルが返る。
    pub fn buffer_get(&self, buffer: BufferId, amount: &mut u64) -> Signal {
        let _ = self.expect_current("buffer get");
        let rid = buffer.0;
        let (front, rear) = {
            let inst = self.inst();
            let b = inst.resources[rid.index()].buffer();
            (b.front, b.rear)
        };
        let requested = *amount;
        let mut rem = requested;
        loop {
            let (took, level_after) = {
                let mut borrow = self.inst_mut();
                let inst = &mut *borrow;
                let now = inst.calendar.now();
                let b = inst.resources[rid.index()].buffer_mut();
                let took = rem.min(b.level);
                if took > 0 {
                    b.level -= took;
                    record_buffer(b, now);
                }
                (took, b.level)
            };
            if took > 0 {
                rem -= took;
                // 生産側に空きができたことを知らせ、残りがあれば消費側にも回す
                self.guard_signal(rear);
                if level_after > 0 {
                    self.guard_signal(front);
                }
            }
            if rem == 0 {
                *amount = requested;
                return Signal::SUCCESS;
            }
            let signal = self.guard_wait(front, Demand::NonEmpty);
            if !signal.is_success() {
                *amount = requested - rem;
                return signal;
            }
        }
    }

    /// `*amount` 単位を入れる（貪欲）
    ///
    /// get と対称。戻るとき `*amount` は実際に入れられた量。
    pub fn buffer_put(&self, buffer: BufferId, amount: &mut u64) -> Signal {
        let _ = self.expect_current("buffer put");
        let rid = buffer.0;
        let (front, rear) = {
            let inst = self.inst();
            let b = inst.resources[rid.index()].buffer();
            (b.front, b.rear)
        };
        let requested = *amount;
        let mut rem = requested;
        loop {
            let (put, level_after, capacity) = {
                let mut borrow = self.inst_mut();
                let inst = &mut *borrow;
                let now = inst.calendar.now();
                let b = inst.resources[rid.index()].buffer_mut();
                let put = rem.min(b.capacity - b.level);
                if put > 0 {
                    b.level += put;
                    record_buffer(b, now);
                }
                (put, b.level, b.capacity)
            };
            if put > 0 {
                rem -= put;
                // 消費側へ在庫を知らせ、まだ空きがあれば生産側にも回す
                self.guard_signal(front);
                if level_after < capacity {
                    self.guard_signal(rear);
                }
            }
            if rem == 0 {
                *amount = requested;
                return Signal::SUCCESS;
            }
            let signal = self.guard_wait(rear, Demand::NotFull);
            if !signal.is_success() {
                *amount = requested - rem;
                return signal;
            }
        }
    }

    // =========================================================================
    // 照会
    // =========================================================================

    /// 現在の水位
    pub fn buffer_level(&self, buffer: BufferId) -> u64 {
        self.inst().resources[buffer.0.index()].buffer().level
    }

    /// 容量
    pub fn buffer_capacity(&self, buffer: BufferId) -> u64 {
        self.inst().resources[buffer.0.index()].buffer().capacity
    }

    /// 消費側 guard
    pub fn buffer_front_guard(&self, buffer: BufferId) -> GuardId {
        self.inst().resources[buffer.0.index()].buffer().front
    }

    /// 生産側 guard
    pub fn buffer_rear_guard(&self, buffer: BufferId) -> GuardId {
        self.inst().resources[buffer.0.index()].buffer().rear
    }

    /// 水位の記録を開始する（既存の記録は破棄）
    pub fn buffer_start_recording(&self, buffer: BufferId) {
        let mut borrow = self.inst_mut();
        let inst = &mut *borrow;
        let now = inst.calendar.now();
        let b = inst.resources[buffer.0.index()].buffer_mut();
        let mut trace = Trace::new();
        trace.add(b.level as f64, now);
        b.trace = Some(trace);
    }

    /// 記録を終了し、トレースを引き取る
    pub fn buffer_stop_recording(&self, buffer: BufferId) -> Option<Trace> {
        self.inst_mut().resources[buffer.0.index()].buffer_mut().trace.take()
    }

    /// 記録済みサンプルの複製
    pub fn buffer_history(&self, buffer: BufferId) -> Vec<Sample> {
        self.inst().resources[buffer.0.index()]
            .buffer()
            .trace
            .as_ref()
            .map(|t| t.samples().to_vec())
            .unwrap_or_default()
    }

    /// buffer を撤去する。両側の待機者は CANCELLED で追い出される。
    pub fn destroy_buffer(&self, buffer: BufferId) {
        let (front, rear) = {
            let inst = self.inst();
            let b = inst.resources[buffer.0.index()].buffer();
            (b.front, b.rear)
        };
        crate::resource::teardown_guard(self, front);
        crate::resource::teardown_guard(self, rear);
        self.inst_mut().resources.remove(buffer.0.index());
    }
}
