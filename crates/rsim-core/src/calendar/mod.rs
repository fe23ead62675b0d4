//! イベントカレンダー
//!
//! インスタンスごとのシミュレーション時計と、保留イベントの順序付き集合。
//! ディスパッチループ本体は `sim` モジュール側にあり、ここはカレンダーの
//! データ操作（schedule / cancel / pattern 検索 / 待機者表）を担う。
//!
//! # 順序
//!
//! (時刻昇順, 優先度降順, ハンドル昇順)。同時刻・同優先度は発行順 FIFO。
//! 時計は単調非減少で、過去への schedule は契約違反として即 panic する。
//!
//! # イベント待機者
//!
//! イベント発火・取り消しを待つプロセスの集合は、heap tag を広げずに
//! ハンドルを鍵とする並行表で持つ（tag は 3 スロットのまま Copy を保つ）。

use std::collections::HashMap;

use smallvec::SmallVec;

use crate::pqueue::{PrioQueue, calendar_order};
use crate::process::ProcessId;
use crate::sim::Sim;
use crate::types::Handle;

/// イベントアクション
///
/// ディスパッチャが `(subject, object)` を引数に呼び出す。
/// プロセスの起動・覚醒・割り込みもすべてこの形のアクションで表す。
pub type EventFn = fn(&Sim, u64, u64);

/// カレンダーイベント（heap ペイロード）
#[derive(Clone, Copy)]
pub struct EventRec {
    /// 実行される関数
    pub action: EventFn,
    /// 第1引数（多くはプロセス識別子）
    pub subject: u64,
    /// 第2引数（多くはシグナル値）
    pub object: u64,
}

/// パターン検索の 1 スロット
///
/// C 流の all-bits-set 番兵の代わりに、ワイルドカードを型で表す。
#[derive(Debug, Clone, Copy)]
pub enum Match<T> {
    /// 任意の値に一致
    Any,
    /// この値にのみ一致
    Is(T),
}

impl Match<u64> {
    #[inline]
    fn matches(&self, v: u64) -> bool {
        match self {
            Match::Any => true,
            Match::Is(x) => *x == v,
        }
    }
}

/// (action, subject, object) に対するワイルドカード付きパターン
#[derive(Clone, Copy)]
pub struct EventPattern {
    pub action: Match<EventFn>,
    pub subject: Match<u64>,
    pub object: Match<u64>,
}

impl EventPattern {
    fn matches(&self, rec: &EventRec) -> bool {
        let action_ok = match self.action {
            Match::Any => true,
            Match::Is(f) => std::ptr::fn_addr_eq(f, rec.action),
        };
        action_ok && self.subject.matches(rec.subject) && self.object.matches(rec.object)
    }
}

/// イベントカレンダー
pub struct Calendar {
    clock: f64,
    queue: PrioQueue<EventRec>,
    /// イベントハンドル → そのイベントを待つプロセス
    waiters: HashMap<Handle, SmallVec<[ProcessId; 2]>>,
}

impl Calendar {
    /// 開始時刻を指定して生成
    pub fn new(start_time: f64) -> Self {
        Self {
            clock: start_time,
            queue: PrioQueue::new(calendar_order::<EventRec>),
            waiters: HashMap::new(),
        }
    }

    /// 現在時刻
    #[inline]
    pub fn now(&self) -> f64 {
        self.clock
    }

    /// 保留イベント数
    #[inline]
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// イベントを登録する
    ///
    /// 事前条件: `time >= now()`。違反は契約違反として panic。
    pub fn schedule(
        &mut self,
        action: EventFn,
        subject: u64,
        object: u64,
        time: f64,
        priority: i64,
    ) -> Handle {
        assert!(
            time >= self.clock,
            "schedule into the past: t={time} < clock={}",
            self.clock
        );
        self.queue.enqueue(EventRec { action, subject, object }, time, priority, 0)
    }

    /// まだ予定に残っているか
    #[inline]
    pub fn is_scheduled(&self, handle: Handle) -> bool {
        self.queue.contains(handle)
    }

    /// 予定時刻
    #[inline]
    pub fn time_of(&self, handle: Handle) -> Option<f64> {
        self.queue.get(handle).map(|t| t.dkey)
    }

    /// 予定優先度
    #[inline]
    pub fn priority_of(&self, handle: Handle) -> Option<i64> {
        self.queue.get(handle).map(|t| t.ikey)
    }

    /// イベントを取り除き、登録されていた待機者を返す
    ///
    /// 見つからなければ None（相手が先に片付けた正当な競合）。
    /// 待機者への CANCELLED 通知は呼び出し側（sim）の責務。
    pub fn remove(&mut self, handle: Handle) -> Option<SmallVec<[ProcessId; 2]>> {
        if !self.queue.cancel(handle) {
            return None;
        }
        Some(self.waiters.remove(&handle).unwrap_or_default())
    }

    /// 予定時刻を変更する（優先度は維持）
    pub fn reschedule(&mut self, handle: Handle, time: f64) -> bool {
        assert!(
            time >= self.clock,
            "reschedule into the past: t={time} < clock={}",
            self.clock
        );
        let Some(tag) = self.queue.get(handle) else {
            return false;
        };
        let ikey = tag.ikey;
        self.queue.reprioritize(handle, time, ikey, 0)
    }

    /// 予定優先度を変更する（時刻は維持）
    pub fn reprioritize(&mut self, handle: Handle, priority: i64) -> bool {
        let Some(tag) = self.queue.get(handle) else {
            return false;
        };
        let dkey = tag.dkey;
        self.queue.reprioritize(handle, dkey, priority, 0)
    }

    /// 先頭イベントの予定時刻
    #[inline]
    pub fn peek_time(&self) -> Option<f64> {
        self.queue.peek_dkey()
    }

    /// 時計を `t` まで進める（イベントを消化せずに）
    ///
    /// 過去への巻き戻しは無視する。先頭イベントより先へは進めない
    /// （そのイベントの schedule 済み時刻が不変条件を破るため）。
    pub fn advance_to(&mut self, t: f64) {
        if t <= self.clock {
            return;
        }
        debug_assert!(
            self.queue.peek_dkey().is_none_or(|next| next >= t),
            "advance_to would pass a pending event"
        );
        self.clock = t;
    }

    /// 先頭イベントを取り出し、時計をその時刻へ進める
    pub fn pop_next(&mut self) -> Option<(Handle, EventRec)> {
        let tag = self.queue.dequeue()?;
        debug_assert!(tag.dkey >= self.clock, "clock would run backwards");
        self.clock = tag.dkey;
        Some((tag.handle, tag.payload))
    }

    /// 発火したイベントの待機者を引き取る
    pub fn take_waiters(&mut self, handle: Handle) -> SmallVec<[ProcessId; 2]> {
        self.waiters.remove(&handle).unwrap_or_default()
    }

    /// イベント待機者を登録する
    ///
    /// 事前条件: イベントが予定に残っていること。
    pub fn add_waiter(&mut self, handle: Handle, pid: ProcessId) {
        assert!(self.queue.contains(handle), "add_waiter on a non-scheduled event {handle}");
        self.waiters.entry(handle).or_default().push(pid);
    }

    /// イベント待機者を外す（沈黙除去）
    pub fn remove_waiter(&mut self, handle: Handle, pid: ProcessId) -> bool {
        let Some(list) = self.waiters.get_mut(&handle) else {
            return false;
        };
        let Some(at) = list.iter().position(|p| *p == pid) else {
            return false;
        };
        list.swap_remove(at);
        if list.is_empty() {
            self.waiters.remove(&handle);
        }
        true
    }

    /// パターンに一致する最初のイベント（heap 走査順）
    pub fn find(&self, pattern: &EventPattern) -> Option<Handle> {
        self.queue.iter().find(|t| pattern.matches(&t.payload)).map(|t| t.handle)
    }

    /// パターンに一致するイベント数
    pub fn count(&self, pattern: &EventPattern) -> usize {
        self.queue.iter().filter(|t| pattern.matches(&t.payload)).count()
    }

    /// パターンに一致する全ハンドル（取り消しの 1 パス目）
    ///
    /// 走査中の変更を避けるため、収集と除去は必ず 2 パスに分ける。
    pub fn collect(&self, pattern: &EventPattern) -> Vec<Handle> {
        self.queue.iter().filter(|t| pattern.matches(&t.payload)).map(|t| t.handle).collect()
    }

    /// 全イベントと待機者表を破棄する（時計は維持）
    pub fn clear(&mut self) {
        self.queue.clear();
        self.waiters.clear();
    }

    /// 不変条件検査（テスト用）
    #[cfg(any(test, feature = "debug"))]
    pub fn validate(&self) {
        self.queue.validate();
        for tag in self.queue.iter() {
            assert!(tag.dkey >= self.clock, "pending event in the past");
        }
        for handle in self.waiters.keys() {
            assert!(self.queue.contains(*handle), "waiter list for a dead event");
        }
    }
}
