//! coroutine モジュールのテスト

use std::cell::Cell;
use std::rc::Rc;

use super::{CoStatus, CoYield, Coroutine, DEFAULT_STACK_SIZE, LaunchBox, co_exit, co_yield};

fn launch_box(body: impl FnOnce() -> i64 + 'static, exit_to: Rc<Cell<i64>>) -> LaunchBox {
    LaunchBox {
        body: Box::new(body),
        on_exit: Box::new(move |v| exit_to.set(v)),
    }
}

#[test]
fn test_run_to_completion() {
    let exit = Rc::new(Cell::new(0));
    let mut co = Coroutine::new(DEFAULT_STACK_SIZE);
    assert_eq!(co.status(), CoStatus::New);
    let r = co.launch(launch_box(|| 42, exit.clone()));
    assert_eq!(r, CoYield::Finished);
    assert_eq!(co.status(), CoStatus::Finished);
    assert_eq!(exit.get(), 42);
}

#[test]
fn test_yield_resume_transfers_values() {
    let exit = Rc::new(Cell::new(0));
    let seen = Rc::new(Cell::new(0));
    let seen2 = seen.clone();
    let mut co = Coroutine::new(DEFAULT_STACK_SIZE);
    let r = co.launch(launch_box(
        move || {
            // yield の戻り値として resume の引数が届く
            let a = co_yield();
            seen2.set(a);
            let b = co_yield();
            a + b
        },
        exit.clone(),
    ));
    assert_eq!(r, CoYield::Suspended);
    assert_eq!(co.status(), CoStatus::Running);
    let r = co.resume(10);
    assert_eq!(r, CoYield::Suspended);
    assert_eq!(seen.get(), 10);
    let r = co.resume(32);
    assert_eq!(r, CoYield::Finished);
    assert_eq!(exit.get(), 42);
}

#[test]
fn test_explicit_exit_skips_rest() {
    let exit = Rc::new(Cell::new(0));
    let mut co = Coroutine::new(DEFAULT_STACK_SIZE);
    let r = co.launch(launch_box(
        || {
            co_exit(7);
        },
        exit.clone(),
    ));
    assert_eq!(r, CoYield::Finished);
    assert_eq!(exit.get(), 7);
}

#[test]
fn test_force_unwind_runs_drops_not_exit_hook() {
    struct DropFlag(Rc<Cell<bool>>);
    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.set(true);
        }
    }

    let exit = Rc::new(Cell::new(-1));
    let dropped = Rc::new(Cell::new(false));
    let dropped2 = dropped.clone();
    let mut co = Coroutine::new(DEFAULT_STACK_SIZE);
    let r = co.launch(launch_box(
        move || {
            let _guard = DropFlag(dropped2);
            let _ = co_yield();
            0
        },
        exit.clone(),
    ));
    assert_eq!(r, CoYield::Suspended);
    let r = co.force_unwind();
    assert_eq!(r, CoYield::Finished);
    assert!(dropped.get(), "locals must be dropped during forced unwind");
    assert_eq!(exit.get(), -1, "exit hook must not run on forced unwind");
}

#[test]
fn test_force_unwind_of_unstarted() {
    let mut co = Coroutine::new(DEFAULT_STACK_SIZE);
    assert_eq!(co.force_unwind(), CoYield::Finished);
    assert_eq!(co.status(), CoStatus::Finished);
}

#[test]
fn test_user_panic_propagates_to_resumer() {
    let exit = Rc::new(Cell::new(0));
    let mut co = Coroutine::new(DEFAULT_STACK_SIZE);
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        co.launch(launch_box(|| panic!("boom"), exit.clone()))
    }));
    assert!(result.is_err(), "user panic must cross the switch");
    assert_eq!(co.status(), CoStatus::Finished);
}

#[test]
fn test_nested_coroutines_restore_parent() {
    // コルーチン A の中からコルーチン B を完走させても
    // A 自身の復帰経路が保たれること
    let exit_a = Rc::new(Cell::new(0));
    let exit_b = Rc::new(Cell::new(0));
    let exit_b2 = exit_b.clone();
    let mut a = Coroutine::new(DEFAULT_STACK_SIZE);
    let r = a.launch(launch_box(
        move || {
            let mut b = Coroutine::new(DEFAULT_STACK_SIZE);
            let r = b.launch(LaunchBox {
                body: Box::new(|| 5),
                on_exit: Box::new(move |v| exit_b2.set(v)),
            });
            assert_eq!(r, CoYield::Finished);
            let v = co_yield();
            v + 1
        },
        exit_a.clone(),
    ));
    assert_eq!(r, CoYield::Suspended);
    assert_eq!(exit_b.get(), 5);
    let r = a.resume(9);
    assert_eq!(r, CoYield::Finished);
    assert_eq!(exit_a.get(), 10);
}
