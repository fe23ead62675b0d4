//! プロセス層
//!
//! プロセスは名前と優先度を持つコルーチン。3 本の相互参照リスト
//! （awaits / waiters / resources）で待機対象・待機者・保持資源と
//! 結ばれる。参照はすべて安定ハンドルか arena 添字で持ち、除去は
//! ハンドル照合で O(1)〜O(短いリスト走査) に収まる。
//!
//! # 待機規律
//!
//! 中断中のプロセスは原則 1 個の awaitable を持つ。例外は時限待ちと
//! 資源待ちの重ね合わせで、先に発火した側が勝ち、もう一方は覚醒時に
//! 取り消される。awaitable の解消は冪等で、相手側が先に記録を消して
//! いても黙って成功する。
//!
//! # 覚醒は必ずカレンダー経由
//!
//! 覚醒・起動・割り込みはすべて現在時刻のイベントとして積まれ、
//! 優先度と FIFO で他のイベントと競合する。「即時に走る」近道はない。

use std::any::Any;
use std::rc::Rc;

use serde::Serialize;
use smallvec::SmallVec;

use crate::coroutine::{CoStatus, CoYield, Coroutine, DEFAULT_STACK_SIZE, LaunchBox, co_exit, co_yield};
use crate::resource::{GuardId, ResourceId};
use crate::sim::{Sim, interrupt_action, schedule_wake, start_action, wake_action, wake_pattern};
use crate::types::{Handle, Signal};

/// プロセス名の最大長（超過分は黙って切り詰める）
pub const NAME_CAP: usize = 32;

/// プロセス識別子
///
/// インスタンス内の arena 添字。destroy 後の添字は後続の spawn で
/// 再利用される（再初期化と同じ意味論）。
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProcessId(usize);

impl ProcessId {
    #[inline]
    pub(crate) fn new(index: usize) -> Self {
        Self(index)
    }

    #[inline]
    pub(crate) fn index(self) -> usize {
        self.0
    }

    #[inline]
    pub(crate) fn raw(self) -> u64 {
        self.0 as u64
    }

    #[inline]
    pub(crate) fn from_raw(v: u64) -> Self {
        Self(v as usize)
    }
}

/// プロセス状態
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ProcessStatus {
    /// 初期化済み・未起動
    New,
    /// コルーチン生存中（実行中または中断中）
    Running,
    /// 終了（exit / stop）
    Finished,
}

/// 待機対象の記録
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Awaitable {
    /// 時限待ち（hold が積んだ覚醒イベント）
    Time { event: Handle },
    /// イベント待ち（wait_event）
    Event { event: Handle },
    /// プロセス終了待ち（wait_process）
    Process { target: ProcessId },
    /// 資源の待ち行列エントリ
    Resource { guard: GuardId, entry: Handle },
}

/// 保持資源の記録（資源側 holder キューへの逆参照）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct HeldResource {
    pub resource: ResourceId,
    /// pool の holder エントリ。binary 資源は NONE。
    pub holder: Handle,
}

/// プロセスレコード
pub(crate) struct ProcessRec {
    pub name: String,
    pub priority: i64,
    pub status: ProcessStatus,
    /// 中断中のコルーチン。実行中（CPU 上）は取り出されて None。
    pub coroutine: Option<Coroutine>,
    /// 起動待ちのユーザー処理
    pub body: Option<Box<dyn FnOnce(&Sim) -> i64>>,
    /// 予定済みの起動イベント
    pub start_event: Handle,
    pub exit_value: i64,
    /// ユーザー定義の付帯データ
    pub context: Option<Box<dyn Any>>,
    pub awaits: SmallVec<[Awaitable; 2]>,
    pub waiters: SmallVec<[ProcessId; 2]>,
    pub resources: SmallVec<[HeldResource; 2]>,
}

fn clamp_name(name: &str) -> String {
    name.chars().take(NAME_CAP).collect()
}

impl Sim {
    // =========================================================================
    // 生成と起動
    // =========================================================================

    /// プロセスを生成する（未起動）
    pub fn spawn<F>(&self, name: &str, priority: i64, body: F) -> ProcessId
    where
        F: FnOnce(&Sim) -> i64 + 'static,
    {
        self.spawn_with_stack(name, priority, DEFAULT_STACK_SIZE, body)
    }

    /// スタックサイズを指定してプロセスを生成する
    pub fn spawn_with_stack<F>(
        &self,
        name: &str,
        priority: i64,
        stack_size: usize,
        body: F,
    ) -> ProcessId
    where
        F: FnOnce(&Sim) -> i64 + 'static,
    {
        let mut inst = self.inst_mut();
        let index = inst.processes.insert(ProcessRec {
            name: clamp_name(name),
            priority,
            status: ProcessStatus::New,
            coroutine: Some(Coroutine::new(stack_size)),
            body: Some(Box::new(body)),
            start_event: Handle::NONE,
            exit_value: 0,
            context: None,
            awaits: SmallVec::new(),
            waiters: SmallVec::new(),
            resources: SmallVec::new(),
        });
        ProcessId::new(index)
    }

    /// プロセスの起動を予約する
    ///
    /// 現在時刻・プロセス優先度の起動イベントを積む。起動そのものは
    /// ディスパッチャがそのイベントを消化した時点。
    pub fn start(&self, pid: ProcessId) {
        let mut guard = self.inst_mut();
        let inst = &mut *guard;
        let rec = inst.processes.get_mut(pid.index()).expect("start of an unknown process");
        assert_eq!(rec.status, ProcessStatus::New, "start of an already-started process");
        assert!(rec.start_event.is_none(), "start already scheduled");
        let now = inst.calendar.now();
        rec.start_event = inst.calendar.schedule(start_action, pid.raw(), 0, now, rec.priority);
    }

    /// 起動イベントの本体。コルーチンを立ち上げ、最初の中断まで走らせる。
    pub(crate) fn launch_process(&self, pid: ProcessId) {
        let (mut co, launch) = {
            let mut inst = self.inst_mut();
            let Some(rec) = inst.processes.get_mut(pid.index()) else {
                log::warn!("start of unknown process {pid:?} dropped");
                return;
            };
            if rec.status != ProcessStatus::New {
                log::warn!("start of non-new process {pid:?} dropped");
                return;
            }
            rec.status = ProcessStatus::Running;
            rec.start_event = Handle::NONE;
            let body = rec.body.take().expect("process body missing");
            let co = rec.coroutine.take().expect("process coroutine missing");
            let weak = Rc::downgrade(&self.inst);
            let weak_exit = weak.clone();
            let launch = LaunchBox {
                body: Box::new(move || {
                    let sim = Sim { inst: weak.upgrade().expect("simulation instance dropped") };
                    body(&sim)
                }),
                on_exit: Box::new(move |retval| {
                    let sim = Sim { inst: weak_exit.upgrade().expect("simulation instance dropped") };
                    sim.finish_process(pid, retval);
                }),
            };
            (co, launch)
        };
        let prev = self.swap_current(Some(pid));
        let r = co.launch(launch);
        self.swap_current(prev);
        self.reinstall(pid, co, r);
    }

    /// 中断中のプロセスをシグナル付きで再開する（覚醒イベントの本体）
    pub(crate) fn resume_process(&self, pid: ProcessId, signal: Signal) {
        let mut co = {
            let mut inst = self.inst_mut();
            let Some(rec) = inst.processes.get_mut(pid.index()) else {
                log::warn!("wake of unknown process {pid:?} dropped");
                return;
            };
            if rec.status != ProcessStatus::Running {
                log::warn!("wake of non-running process {pid:?} dropped");
                return;
            }
            match rec.coroutine.take() {
                Some(co) => co,
                None => {
                    log::warn!("wake of an executing process {pid:?} dropped");
                    return;
                }
            }
        };
        let prev = self.swap_current(Some(pid));
        let r = co.resume(signal.raw());
        self.swap_current(prev);
        self.reinstall(pid, co, r);
    }

    fn reinstall(&self, pid: ProcessId, co: Coroutine, r: CoYield) {
        if r == CoYield::Suspended {
            debug_assert_eq!(co.status(), CoStatus::Running);
            self.inst_mut().processes[pid.index()].coroutine = Some(co);
        }
        // Finished: 終了処理は on_exit（exit 経路）か stop 側で済んでいる
    }

    pub(crate) fn swap_current(&self, pid: Option<ProcessId>) -> Option<ProcessId> {
        std::mem::replace(&mut self.inst_mut().current, pid)
    }

    // =========================================================================
    // 中断操作（プロセスコルーチンからのみ呼べる）
    // =========================================================================

    /// シミュレーション時間で `duration` だけ眠る
    ///
    /// 戻り値が SUCCESS なら満了。それ以外は割り込みで、時限イベントは
    /// この関数が後始末してから割り込みシグナルを返す。
    pub fn hold(&self, duration: f64) -> Signal {
        assert!(duration >= 0.0, "hold duration must be non-negative, got {duration}");
        let pid = self.expect_current("hold");
        {
            let mut guard = self.inst_mut();
            let inst = &mut *guard;
            let rec = &inst.processes[pid.index()];
            assert!(
                !rec.awaits.iter().any(|a| matches!(a, Awaitable::Time { .. })),
                "hold while another timed wait is active"
            );
            let at = inst.calendar.now() + duration;
            let event = inst.calendar.schedule(
                wake_action,
                pid.raw(),
                Signal::SUCCESS.raw() as u64,
                at,
                rec.priority,
            );
            inst.processes[pid.index()].awaits.push(Awaitable::Time { event });
        }
        let signal = Signal::from_raw(co_yield());
        // 満了でも割り込みでも、時限 awaitable と残イベントはここで畳む（冪等）
        let mut guard = self.inst_mut();
        let inst = &mut *guard;
        let rec = &mut inst.processes[pid.index()];
        if let Some(at) = rec.awaits.iter().position(|a| matches!(a, Awaitable::Time { .. })) {
            let Awaitable::Time { event } = rec.awaits.swap_remove(at) else { unreachable!() };
            inst.calendar.remove(event);
        }
        signal
    }

    /// 対象プロセスの終了を待つ
    ///
    /// 既に終了していれば即 SUCCESS。正常終了で SUCCESS、stop で
    /// STOPPED、自分が割り込まれればそのシグナルが返る。
    pub fn wait_process(&self, target: ProcessId) -> Signal {
        let pid = self.expect_current("wait_process");
        assert_ne!(pid, target, "a process cannot wait for itself");
        {
            let mut inst = self.inst_mut();
            let trec = inst.processes.get(target.index()).expect("wait for an unknown process");
            if trec.status == ProcessStatus::Finished {
                return Signal::SUCCESS;
            }
            inst.processes[target.index()].waiters.push(pid);
            inst.processes[pid.index()].awaits.push(Awaitable::Process { target });
        }
        let signal = Signal::from_raw(co_yield());
        let mut inst = self.inst_mut();
        let rec = &mut inst.processes[pid.index()];
        if let Some(at) = rec
            .awaits
            .iter()
            .position(|a| matches!(a, Awaitable::Process { target: t } if *t == target))
        {
            rec.awaits.swap_remove(at);
        }
        // 割り込み時は相手側 waiters の自分も外す（正常時は相手が回収済み）
        if let Some(trec) = inst.processes.get_mut(target.index())
            && let Some(at) = trec.waiters.iter().position(|w| *w == pid)
        {
            trec.waiters.swap_remove(at);
        }
        signal
    }

    /// 予定済みイベントの発火（または取り消し）を待つ
    ///
    /// 事前条件: イベントが予定に残っていること。発火で SUCCESS、
    /// 取り消しで CANCELLED。
    pub fn wait_event(&self, event: Handle) -> Signal {
        let pid = self.expect_current("wait_event");
        {
            let mut guard = self.inst_mut();
            let inst = &mut *guard;
            assert!(inst.calendar.is_scheduled(event), "wait_event on a non-scheduled event");
            inst.calendar.add_waiter(event, pid);
            inst.processes[pid.index()].awaits.push(Awaitable::Event { event });
        }
        let signal = Signal::from_raw(co_yield());
        let mut guard = self.inst_mut();
        let inst = &mut *guard;
        let rec = &mut inst.processes[pid.index()];
        if let Some(at) = rec
            .awaits
            .iter()
            .position(|a| matches!(a, Awaitable::Event { event: e } if *e == event))
        {
            rec.awaits.swap_remove(at);
        }
        inst.calendar.remove_waiter(event, pid);
        signal
    }

    /// 実行中のプロセスを戻り値付きで即終了する
    pub fn exit(&self, retval: i64) -> ! {
        let _ = self.expect_current("exit");
        co_exit(retval)
    }

    // =========================================================================
    // 外部からの操作
    // =========================================================================

    /// 割り込みを予約する
    ///
    /// シグナルは非ゼロ必須。現在時刻・指定優先度の割り込みイベントを
    /// 積み、発火時に対象の awaitable をすべて解消して再開させる。
    pub fn interrupt(&self, target: ProcessId, signal: Signal, priority: i64) -> Handle {
        assert!(!signal.is_success(), "interrupt requires a non-zero signal");
        let mut inst = self.inst_mut();
        assert!(inst.processes.contains(target.index()), "interrupt of an unknown process");
        let now = inst.calendar.now();
        inst.calendar.schedule(interrupt_action, target.raw(), signal.raw() as u64, now, priority)
    }

    /// プロセスを外部から強制終了する
    ///
    /// 対象が Running でなければ警告して false。対象のスタックを
    /// 巻き戻し、awaitable と保持資源を解消し、待機者を STOPPED で
    /// 覚醒させる。
    pub fn stop(&self, target: ProcessId, retval: i64) -> bool {
        assert_ne!(self.inst().current, Some(target), "stop of the current process; use exit");
        let mut co = {
            let mut inst = self.inst_mut();
            let Some(rec) = inst.processes.get_mut(target.index()) else {
                log::warn!("stop of unknown process {target:?} ignored");
                return false;
            };
            if rec.status != ProcessStatus::Running {
                log::warn!("stop of non-running process {target:?} ignored");
                return false;
            }
            match rec.coroutine.take() {
                Some(co) => co,
                None => {
                    // 呼び出し連鎖の途中にいる祖先は巻き戻せない
                    log::warn!("stop of an executing process {target:?} ignored");
                    return false;
                }
            }
        };
        let touched = self.cancel_awaitables(target);
        let prev = self.swap_current(Some(target));
        let r = co.force_unwind();
        self.swap_current(prev);
        debug_assert_eq!(r, CoYield::Finished);
        drop(co);

        let held = std::mem::take(&mut self.inst_mut().processes[target.index()].resources);
        for hr in held {
            self.drop_held(target, hr);
        }
        self.wake_waiters(target, Signal::STOPPED);
        {
            let mut inst = self.inst_mut();
            let rec = &mut inst.processes[target.index()];
            rec.status = ProcessStatus::Finished;
            rec.exit_value = retval;
        }
        for g in touched {
            self.guard_signal(g);
        }
        true
    }

    /// 優先度を変更する
    ///
    /// 優先度順キューに入っている全エントリ（起動イベント、時限イベント、
    /// 資源待ちエントリ、pool 保持レコード）も追従して並び直す。
    pub fn set_priority(&self, pid: ProcessId, priority: i64) {
        let mut guard = self.inst_mut();
        let inst = &mut *guard;
        let Some(rec) = inst.processes.get_mut(pid.index()) else {
            log::warn!("set_priority of unknown process {pid:?} ignored");
            return;
        };
        rec.priority = priority;
        if rec.start_event.is_some() {
            inst.calendar.reprioritize(rec.start_event, priority);
        }
        for a in rec.awaits.iter().copied() {
            match a {
                Awaitable::Time { event } => {
                    inst.calendar.reprioritize(event, priority);
                }
                Awaitable::Resource { guard: g, entry } => {
                    inst.guards[g.index()].queue.reprioritize(entry, 0.0, priority, pid.raw());
                }
                Awaitable::Event { .. } | Awaitable::Process { .. } => {}
            }
        }
        let held: SmallVec<[HeldResource; 2]> = rec.resources.clone();
        for hr in held {
            if hr.holder.is_some() {
                crate::resource::reprioritize_holder(inst, hr, priority, pid);
            }
        }
    }

    /// 終了済み（または未起動）のプロセスを破棄する
    ///
    /// Running のプロセスは破棄できない（契約違反）。未起動なら予約済みの
    /// 起動イベントも取り消す。
    pub fn destroy_process(&self, pid: ProcessId) {
        let mut guard = self.inst_mut();
        let inst = &mut *guard;
        let rec = inst.processes.get_mut(pid.index()).expect("destroy of an unknown process");
        assert_ne!(rec.status, ProcessStatus::Running, "destroy of a running process");
        debug_assert!(rec.awaits.is_empty(), "destroyed process still has awaitables");
        debug_assert!(rec.resources.is_empty(), "destroyed process still holds resources");
        if rec.start_event.is_some() {
            inst.calendar.remove(rec.start_event);
        }
        inst.processes.remove(pid.index());
    }

    // =========================================================================
    // 照会
    // =========================================================================

    /// プロセス状態
    pub fn status(&self, pid: ProcessId) -> ProcessStatus {
        self.inst().processes.get(pid.index()).expect("unknown process").status
    }

    /// 終了値（Finished 以外では既定値 0）
    pub fn exit_value(&self, pid: ProcessId) -> i64 {
        self.inst().processes.get(pid.index()).expect("unknown process").exit_value
    }

    /// 優先度
    pub fn priority(&self, pid: ProcessId) -> i64 {
        self.inst().processes.get(pid.index()).expect("unknown process").priority
    }

    /// プロセス名
    pub fn process_name(&self, pid: ProcessId) -> String {
        self.inst().processes.get(pid.index()).expect("unknown process").name.clone()
    }

    /// プロセス名を変更する（32 文字で切り詰め）
    pub fn set_process_name(&self, pid: ProcessId, name: &str) {
        self.inst_mut().processes.get_mut(pid.index()).expect("unknown process").name =
            clamp_name(name);
    }

    /// ユーザー定義データを設定する
    pub fn set_context(&self, pid: ProcessId, context: Box<dyn Any>) {
        self.inst_mut().processes.get_mut(pid.index()).expect("unknown process").context =
            Some(context);
    }

    /// ユーザー定義データを取り出す
    pub fn take_context(&self, pid: ProcessId) -> Option<Box<dyn Any>> {
        self.inst_mut().processes.get_mut(pid.index()).expect("unknown process").context.take()
    }

    // =========================================================================
    // 内部: awaitable / waiter の解消
    // =========================================================================

    /// 割り込み・終了が可能な状態（中断中）か
    pub(crate) fn is_interruptible(&self, pid: ProcessId) -> bool {
        self.inst()
            .processes
            .get(pid.index())
            .is_some_and(|r| r.status == ProcessStatus::Running && r.coroutine.is_some())
    }

    /// 対象の awaitable をすべて解消する
    ///
    /// 時限イベントはカレンダーから、資源待ちは guard のキューから、
    /// イベント・プロセス待機は相手側リストから取り除く。どれも冪等。
    /// 保留中の覚醒イベントの残骸も 2 パスで掃除する。
    /// 待ち行列を触った guard の一覧を返す（再 signal は呼び出し側で）。
    pub(crate) fn cancel_awaitables(&self, pid: ProcessId) -> SmallVec<[GuardId; 2]> {
        let mut touched: SmallVec<[GuardId; 2]> = SmallVec::new();
        let mut guard = self.inst_mut();
        let inst = &mut *guard;
        let awaits = std::mem::take(&mut inst.processes[pid.index()].awaits);
        for a in awaits {
            match a {
                Awaitable::Time { event } => {
                    if inst.calendar.remove(event).is_none() {
                        log::debug!("timed wake of {pid:?} already gone");
                    }
                }
                Awaitable::Event { event } => {
                    inst.calendar.remove_waiter(event, pid);
                }
                Awaitable::Process { target } => {
                    if let Some(trec) = inst.processes.get_mut(target.index())
                        && let Some(at) = trec.waiters.iter().position(|w| *w == pid)
                    {
                        trec.waiters.swap_remove(at);
                    }
                }
                Awaitable::Resource { guard: g, entry } => {
                    inst.guards[g.index()].queue.cancel(entry);
                    if !touched.contains(&g) {
                        touched.push(g);
                    }
                }
            }
        }
        for h in inst.calendar.collect(&wake_pattern(pid)) {
            inst.calendar.remove(h);
        }
        touched
    }

    /// 対象の待機者全員を指定シグナルで覚醒させる
    pub(crate) fn wake_waiters(&self, pid: ProcessId, signal: Signal) {
        let mut inst = self.inst_mut();
        let waiters = std::mem::take(&mut inst.processes[pid.index()].waiters);
        for w in waiters {
            schedule_wake(&mut inst, w, signal);
        }
    }

    /// 正常終了経路（コルーチンスタック上の exit フックから呼ばれる）
    ///
    /// 保持資源の返却 → awaitable 解消 → 待機者の SUCCESS 覚醒 →
    /// レコード確定、の順。
    pub(crate) fn finish_process(&self, pid: ProcessId, retval: i64) {
        let held = std::mem::take(&mut self.inst_mut().processes[pid.index()].resources);
        for hr in held {
            self.drop_held(pid, hr);
        }
        let touched = self.cancel_awaitables(pid);
        for g in touched {
            self.guard_signal(g);
        }
        self.wake_waiters(pid, Signal::SUCCESS);
        let mut inst = self.inst_mut();
        let rec = &mut inst.processes[pid.index()];
        rec.status = ProcessStatus::Finished;
        rec.exit_value = retval;
    }
}
