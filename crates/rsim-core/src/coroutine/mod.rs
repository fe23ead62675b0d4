//! コルーチンランタイム
//!
//! stackful・協調・対称な context switch の薄いラッパ。
//! Boost.Context 系の `context` crate を土台に、シミュレーション
//! プロセスが必要とする launch / yield / resume / 強制終了だけを提供する。
//!
//! # プロトコル
//!
//! 切り替えで運ぶ `usize` の意味は方向で異なる。
//!
//! - 親 → コルーチン: 再開シグナル（初回のみ起動ペイロードへのポインタ）
//! - コルーチン → 親: `YIELDED` (=0) / `FINISHED` (=1) /
//!   それ以外 = ユーザー panic ペイロードへのポインタ（親側で再送出）
//!
//! # 単一実行者の不変条件
//!
//! スレッドごとに「親 context」スロットを 1 つ持ち、切り替えのたびに
//! 保存・復元する。これによりコルーチンから別コルーチンを resume する
//! 入れ子（stop の強制巻き戻し等）でも復帰経路が壊れない。
//!
//! # スタック
//!
//! 各コルーチンは guard page 付きの専有スタックを持つ。さらに最下位
//! ワードに番兵値を書き、切り替えのたびに検査する。破壊は即 panic。

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::panic::{self, AssertUnwindSafe};

use context::stack::ProtectedFixedSizeStack;
use context::{Context, Transfer};

/// プロセス用スタックの既定サイズ
pub const DEFAULT_STACK_SIZE: usize = 256 * 1024;

/// スタック最下位ワードの番兵値
const STACK_SENTINEL: u64 = 0x5A5A_C0DE_57AC_4B1D;

/// コルーチン → 親: 中断中
const YIELDED: usize = 0;
/// コルーチン → 親: 終了
const FINISHED: usize = 1;

thread_local! {
    /// 現在実行中のコルーチンが戻るべき親 context
    static PARENT: RefCell<Option<Context>> = const { RefCell::new(None) };
    /// 次の yield 復帰点で強制巻き戻しを発火させるフラグ
    static UNWIND: Cell<bool> = const { Cell::new(false) };
}

/// `exit(retval)` が投げる内部ペイロード
struct ExitRequest(i64);

/// 強制終了（stop）が投げる内部ペイロード
struct ForcedUnwind;

/// コルーチン状態
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoStatus {
    /// 生成済み・未起動
    New,
    /// 起動済み（実行中または中断中）
    Running,
    /// 終了
    Finished,
}

/// 1 回の切り替えの結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoYield {
    /// コルーチンは yield で中断した
    Suspended,
    /// コルーチンは終了した
    Finished,
}

/// 起動ペイロード
///
/// `body` はユーザー処理。`on_exit` は body の戻り値（または `co_exit` の
/// 引数）を受け取ってコルーチンスタック上で実行される終了フック。
/// 強制巻き戻しでは `on_exit` は呼ばれない（後始末は停止側の責務）。
pub struct LaunchBox {
    pub body: Box<dyn FnOnce() -> i64>,
    pub on_exit: Box<dyn FnOnce(i64)>,
}

/// stackful コルーチン
pub struct Coroutine {
    stack: ProtectedFixedSizeStack,
    ctx: Option<Context>,
    status: CoStatus,
}

impl Coroutine {
    /// スタックを確保してコルーチンを生成する
    ///
    /// 確保失敗は致命的エラー（このライブラリの想定構成では起きない）。
    pub fn new(stack_size: usize) -> Self {
        let stack = ProtectedFixedSizeStack::new(stack_size)
            .unwrap_or_else(|e| panic!("coroutine stack allocation failed: {e:?}"));
        // 番兵はスタック最下位（guard page 直上）の 1 ワード
        unsafe {
            (stack.bottom() as *mut u64).write(STACK_SENTINEL);
        }
        let ctx = unsafe { Context::new(&stack, trampoline) };
        Self { stack, ctx: Some(ctx), status: CoStatus::New }
    }

    /// 状態を取得
    #[inline]
    pub fn status(&self) -> CoStatus {
        self.status
    }

    /// 起動して body の実行を開始する
    ///
    /// 最初の yield（または終了）まで戻らない。
    pub fn launch(&mut self, launch: LaunchBox) -> CoYield {
        assert_eq!(self.status, CoStatus::New, "launch on a started coroutine");
        self.status = CoStatus::Running;
        let data = Box::into_raw(Box::new(launch)) as usize;
        self.switch(data, false)
    }

    /// 中断中のコルーチンへシグナルを渡して再開する
    pub fn resume(&mut self, signal: i64) -> CoYield {
        assert_eq!(self.status, CoStatus::Running, "resume on a non-running coroutine");
        self.switch(signal as usize, false)
    }

    /// 強制巻き戻し
    ///
    /// 中断点に `ForcedUnwind` を送出させ、ユーザーコードを実行させずに
    /// スタックを畳む。未起動ならそのまま終了扱いにする。
    pub fn force_unwind(&mut self) -> CoYield {
        match self.status {
            CoStatus::New => {
                self.ctx = None;
                self.status = CoStatus::Finished;
                CoYield::Finished
            }
            CoStatus::Running => {
                let r = self.switch(0, true);
                debug_assert_eq!(r, CoYield::Finished, "forced unwind left coroutine alive");
                r
            }
            CoStatus::Finished => CoYield::Finished,
        }
    }

    fn switch(&mut self, data: usize, unwind: bool) -> CoYield {
        let ctx = self.ctx.take().expect("coroutine is not suspended");
        let t = switch_into(ctx, data, unwind);
        self.check_sentinel();
        match t.data {
            YIELDED => {
                self.ctx = Some(t.context);
                CoYield::Suspended
            }
            FINISHED => {
                self.status = CoStatus::Finished;
                CoYield::Finished
            }
            ptr => {
                // ユーザー panic の再送出。コルーチンは終了済み。
                self.status = CoStatus::Finished;
                let payload: Box<dyn Any + Send> =
                    *unsafe { Box::from_raw(ptr as *mut Box<dyn Any + Send>) };
                panic::resume_unwind(payload);
            }
        }
    }

    /// 番兵値の検査。切り替えのたびに呼ぶ。
    fn check_sentinel(&self) {
        let word = unsafe { (self.stack.bottom() as *const u64).read() };
        assert_eq!(word, STACK_SENTINEL, "coroutine stack overflow detected");
    }
}

impl std::fmt::Debug for Coroutine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coroutine")
            .field("status", &self.status)
            .field("stack_len", &self.stack.len())
            .finish()
    }
}

// =============================================================================
// 切り替えプリミティブ
// =============================================================================

/// 対象 context へ切り替える（親スロットを保存・復元する）
fn switch_into(ctx: Context, data: usize, unwind: bool) -> Transfer {
    let saved = PARENT.with(|p| p.borrow_mut().take());
    UNWIND.with(|u| u.set(unwind));
    let t = unsafe { ctx.resume(data) };
    PARENT.with(|p| *p.borrow_mut() = saved);
    t
}

/// 実行中のコルーチンから親へ制御を返す
///
/// 後で resume されたとき、渡されたシグナル値を返す。
/// 強制巻き戻しが要求されていれば `ForcedUnwind` を送出する。
pub fn co_yield() -> i64 {
    let parent = PARENT
        .with(|p| p.borrow_mut().take())
        .expect("yield called outside a coroutine");
    let t = unsafe { parent.resume(YIELDED) };
    PARENT.with(|p| *p.borrow_mut() = Some(t.context));
    if UNWIND.with(|u| u.replace(false)) {
        // panic hook を起動しない巻き戻し（エラーではなく制御フロー）
        panic::resume_unwind(Box::new(ForcedUnwind));
    }
    t.data as i64
}

/// 実行中のコルーチンを戻り値付きで即終了する
///
/// 中断点を経由せず trampoline まで巻き戻り、`on_exit` が呼ばれる。
pub fn co_exit(retval: i64) -> ! {
    panic::resume_unwind(Box::new(ExitRequest(retval)));
}

/// コルーチンの中で実行中かどうか
pub fn in_coroutine() -> bool {
    PARENT.with(|p| p.borrow().is_some())
}

extern "C" fn trampoline(t: Transfer) -> ! {
    let launch = *unsafe { Box::from_raw(t.data as *mut LaunchBox) };
    let LaunchBox { body, on_exit } = launch;
    PARENT.with(|p| *p.borrow_mut() = Some(t.context));

    let outcome: usize = match panic::catch_unwind(AssertUnwindSafe(body)) {
        Ok(v) => {
            on_exit(v);
            FINISHED
        }
        Err(payload) => match payload.downcast::<ExitRequest>() {
            Ok(exit) => {
                on_exit(exit.0);
                FINISHED
            }
            Err(payload) => {
                if payload.is::<ForcedUnwind>() {
                    FINISHED
                } else {
                    // ユーザー panic は親側で再送出する
                    Box::into_raw(Box::new(payload)) as usize
                }
            }
        },
    };

    let parent = PARENT
        .with(|p| p.borrow_mut().take())
        .expect("coroutine finished with no parent context");
    unsafe {
        parent.resume(outcome);
    }
    unreachable!("a finished coroutine was resumed");
}

#[cfg(test)]
mod tests;
