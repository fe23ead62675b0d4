//! シミュレーションインスタンス
//!
//! `Sim` は 1 個のシミュレーション（カレンダー + プロセス群 + 資源群 +
//! 時計）への参照ハンドル。内部状態は `Rc<RefCell<Instance>>` に集約し、
//! スレッドローカルな大域変数は持たない。インスタンスはスレッドをまたいで
//! 共有されない（実験ハーネスはスレッドごとに独立インスタンスを作る）。
//!
//! # 借用規律
//!
//! context switch をまたいで `RefCell` の借用を保持しない。各操作は
//! 「借りる → 状態を更新 → 返す → 必要なら切り替え」を徹底する。
//! 違反は `RefCell` の二重借用 panic として即座に顕在化する。
//!
//! # ディスパッチ
//!
//! `execute_next` がカレンダー先頭のイベントへ時計を進め、アクションを
//! 実行し、イベント待機者を覚醒させる。プロセスの起動・覚醒・割り込みも
//! すべて通常のイベントであり、「即時実行」の近道は存在しない。

use std::cell::{Ref, RefCell, RefMut};
use std::rc::Rc;

use slab::Slab;

use crate::calendar::{Calendar, EventFn, EventPattern, Match};
use crate::process::{ProcessId, ProcessRec};
use crate::resource::{Guard, Resource};
use crate::types::{Handle, Signal};


/// インスタンス内部状態
pub(crate) struct Instance {
    pub(crate) calendar: Calendar,
    pub(crate) processes: Slab<ProcessRec>,
    pub(crate) guards: Slab<Guard>,
    pub(crate) resources: Slab<Resource>,
    /// いま実行中のプロセス（ディスパッチャ実行中は None）
    pub(crate) current: Option<ProcessId>,
}

/// シミュレーションハンドル
///
/// clone は同一インスタンスへの参照を複製するだけで安価。
/// プロセス本体のクロージャには起動時に `&Sim` が渡されるため、
/// ユーザーが `Sim` 自体を捕捉して循環参照を作る必要はない。
#[derive(Clone)]
pub struct Sim {
    pub(crate) inst: Rc<RefCell<Instance>>,
}

impl Sim {
    /// 時刻 0 で新しいインスタンスを生成する
    pub fn new() -> Self {
        Self::starting_at(0.0)
    }

    /// 開始時刻を指定して生成する
    pub fn starting_at(start_time: f64) -> Self {
        Self {
            inst: Rc::new(RefCell::new(Instance {
                calendar: Calendar::new(start_time),
                processes: Slab::new(),
                guards: Slab::new(),
                resources: Slab::new(),
                current: None,
            })),
        }
    }

    #[inline]
    pub(crate) fn inst(&self) -> Ref<'_, Instance> {
        self.inst.borrow()
    }

    #[inline]
    pub(crate) fn inst_mut(&self) -> RefMut<'_, Instance> {
        self.inst.borrow_mut()
    }

    /// 現在のシミュレーション時刻
    pub fn now(&self) -> f64 {
        self.inst().calendar.now()
    }

    /// 保留イベント数
    pub fn pending_events(&self) -> usize {
        self.inst().calendar.pending()
    }

    /// いま実行中のプロセス
    pub fn current_process(&self) -> Option<ProcessId> {
        self.inst().current
    }

    pub(crate) fn expect_current(&self, what: &str) -> ProcessId {
        self.inst()
            .current
            .unwrap_or_else(|| panic!("{what} called outside a simulated process"))
    }

    // =========================================================================
    // カレンダー操作
    // =========================================================================

    /// イベントを登録する（事前条件: `time >= now()`）
    pub fn schedule(
        &self,
        action: EventFn,
        subject: u64,
        object: u64,
        time: f64,
        priority: i64,
    ) -> Handle {
        self.inst_mut().calendar.schedule(action, subject, object, time, priority)
    }

    /// イベントがまだ予定に残っているか
    pub fn is_scheduled(&self, event: Handle) -> bool {
        self.inst().calendar.is_scheduled(event)
    }

    /// イベントの予定時刻
    pub fn time_of(&self, event: Handle) -> Option<f64> {
        self.inst().calendar.time_of(event)
    }

    /// イベントの予定優先度
    pub fn priority_of(&self, event: Handle) -> Option<i64> {
        self.inst().calendar.priority_of(event)
    }

    /// イベントを取り消す
    ///
    /// 待機者には CANCELLED の覚醒イベントを積む。見つからなければ
    /// 警告ログを出して false（相手が先に片付けた正当な競合）。
    pub fn cancel_event(&self, event: Handle) -> bool {
        let mut inst = self.inst_mut();
        match inst.calendar.remove(event) {
            None => {
                drop(inst);
                log::warn!("cancel_event: event {event} not found");
                false
            }
            Some(waiters) => {
                for w in waiters {
                    schedule_wake(&mut inst, w, Signal::CANCELLED);
                }
                true
            }
        }
    }

    /// イベントの予定時刻を変更する
    pub fn reschedule(&self, event: Handle, time: f64) -> bool {
        let moved = self.inst_mut().calendar.reschedule(event, time);
        if !moved {
            log::warn!("reschedule: event {event} not found");
        }
        moved
    }

    /// イベントの予定優先度を変更する
    pub fn reprioritize_event(&self, event: Handle, priority: i64) -> bool {
        let moved = self.inst_mut().calendar.reprioritize(event, priority);
        if !moved {
            log::warn!("reprioritize_event: event {event} not found");
        }
        moved
    }

    /// パターンに一致する最初のイベント
    pub fn find_event(&self, pattern: &EventPattern) -> Option<Handle> {
        self.inst().calendar.find(pattern)
    }

    /// パターンに一致するイベント数
    pub fn count_events(&self, pattern: &EventPattern) -> usize {
        self.inst().calendar.count(pattern)
    }

    /// パターンに一致するイベントをすべて取り消す
    ///
    /// 収集と除去の 2 パス。取り消した件数を返す。待機者は CANCELLED で
    /// 覚醒する。
    pub fn cancel_events(&self, pattern: &EventPattern) -> usize {
        let doomed = self.inst().calendar.collect(pattern);
        let mut n = 0;
        for event in doomed {
            let mut inst = self.inst_mut();
            if let Some(waiters) = inst.calendar.remove(event) {
                for w in waiters {
                    schedule_wake(&mut inst, w, Signal::CANCELLED);
                }
                n += 1;
            }
        }
        n
    }

    /// 全イベントを破棄する（時計・プロセス・資源は維持）
    pub fn clear(&self) {
        self.inst_mut().calendar.clear();
    }

    // =========================================================================
    // ディスパッチループ
    // =========================================================================

    /// 先頭イベントを 1 つ実行する
    ///
    /// カレンダーが空なら false。時計は先頭イベントの時刻へ進む。
    pub fn execute_next(&self) -> bool {
        let (rec, waiters) = {
            let mut inst = self.inst_mut();
            let Some((handle, rec)) = inst.calendar.pop_next() else {
                return false;
            };
            #[cfg(feature = "diagnostics")]
            log::trace!("dispatch event {handle} at t={}", inst.calendar.now());
            let waiters = inst.calendar.take_waiters(handle);
            (rec, waiters)
        };

        (rec.action)(self, rec.subject, rec.object);

        // 発火したイベントの待機者を SUCCESS で覚醒
        let mut inst = self.inst_mut();
        for w in waiters {
            schedule_wake(&mut inst, w, Signal::SUCCESS);
        }
        true
    }

    /// カレンダーが尽きるまで実行する
    pub fn run(&self) {
        while self.execute_next() {}
    }

    /// 時刻 `until` までのイベントを実行する
    ///
    /// `until` より後のイベントは残し、時計は `until` まで進める。
    pub fn run_until(&self, until: f64) {
        loop {
            let next = self.inst().calendar.peek_time();
            match next {
                Some(t) if t <= until => {
                    self.execute_next();
                }
                _ => break,
            }
        }
        self.inst_mut().calendar.advance_to(until);
    }
}

impl Default for Sim {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// 内部イベントアクション
// =============================================================================

/// 覚醒イベントを現在時刻・待機者優先度で積む
pub(crate) fn schedule_wake(inst: &mut Instance, pid: ProcessId, signal: Signal) -> Handle {
    let Some(rec) = inst.processes.get(pid.index()) else {
        log::warn!("wake of unknown process {pid:?}");
        return Handle::NONE;
    };
    let prio = rec.priority;
    let now = inst.calendar.now();
    inst.calendar.schedule(wake_action, pid.raw(), signal.raw() as u64, now, prio)
}

/// プロセス起動イベント
pub(crate) fn start_action(sim: &Sim, subject: u64, _object: u64) {
    sim.launch_process(ProcessId::from_raw(subject));
}

/// プロセス覚醒イベント
pub(crate) fn wake_action(sim: &Sim, subject: u64, object: u64) {
    sim.resume_process(ProcessId::from_raw(subject), Signal::from_raw(object as i64));
}

/// 割り込みイベント
///
/// 対象の awaitable をすべて解消してから、割り込みシグナルで再開する。
/// 解消で空きが生じた guard には再開後にもう一度 signal を送る
/// （対象へ差し出されていた資源を待ち行列へ返すため）。
pub(crate) fn interrupt_action(sim: &Sim, subject: u64, object: u64) {
    let pid = ProcessId::from_raw(subject);
    let signal = Signal::from_raw(object as i64);
    if !sim.is_interruptible(pid) {
        log::warn!("interrupt of non-waiting process {pid:?} ignored");
        return;
    }
    let touched = sim.cancel_awaitables(pid);
    sim.resume_process(pid, signal);
    for guard in touched {
        sim.guard_signal(guard);
    }
}

/// 覚醒イベントのパターン（割り込み時の残骸掃除に使う）
pub(crate) fn wake_pattern(pid: ProcessId) -> EventPattern {
    EventPattern {
        action: Match::Is(wake_action),
        subject: Match::Is(pid.raw()),
        object: Match::Any,
    }
}
