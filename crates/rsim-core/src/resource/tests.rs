//! resource モジュールのテスト（資源の結合シナリオ）

use std::cell::Cell;
use std::rc::Rc;

use crate::process::ProcessStatus;
use crate::sim::Sim;
use crate::types::Signal;

// =============================================================================
// binary 資源
// =============================================================================

#[test]
fn test_binary_mutual_exclusion() {
    let sim = Sim::new();
    let res = sim.create_resource("printer");
    let first = sim.spawn("first", 0, move |sim| {
        assert!(sim.resource_acquire(res).is_success());
        sim.hold(2.0);
        sim.resource_release(res);
        0
    });
    let second = sim.spawn("second", 0, move |sim| {
        assert!(sim.resource_acquire(res).is_success());
        let t = sim.now() as i64;
        sim.resource_release(res);
        t
    });
    sim.start(first);
    sim.start(second);
    sim.run();
    assert_eq!(sim.exit_value(second), 2, "second must wait for the release at t=2");
    assert!(sim.resource_holder(res).is_none());
}

#[test]
fn test_binary_release_by_non_holder_is_fatal() {
    let sim = Sim::new();
    let res = sim.create_resource("lock");
    let p = sim.spawn("cheater", 0, move |sim| {
        sim.resource_release(res);
        0
    });
    sim.start(p);
    let err = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| sim.run()));
    assert!(err.is_err(), "release without holding must abort");
}

// =============================================================================
// pool
// =============================================================================

#[test]
fn test_pool_acquire_release_round_trip() {
    let sim = Sim::new();
    let pool = sim.create_pool("cpus", 4);
    let p = sim.spawn("user", 0, move |sim| {
        assert!(sim.pool_acquire(pool, 3).is_success());
        assert_eq!(sim.pool_in_use(pool), 3);
        assert_eq!(sim.pool_available(pool), 1);
        sim.pool_release(pool, 3);
        assert_eq!(sim.pool_in_use(pool), 0);
        0
    });
    sim.start(p);
    sim.run();
    assert_eq!(sim.pool_holder_count(pool), 0);
    assert_eq!(sim.pool_in_use(pool), 0);
}

#[test]
fn test_pool_partial_release_keeps_holder() {
    let sim = Sim::new();
    let pool = sim.create_pool("cpus", 4);
    let p = sim.spawn("user", 0, move |sim| {
        assert!(sim.pool_acquire(pool, 3).is_success());
        sim.pool_release(pool, 1);
        let me = sim.current_process().unwrap();
        assert_eq!(sim.pool_held_by(pool, me), 2);
        assert_eq!(sim.pool_holder_count(pool), 1);
        sim.pool_release(pool, 2);
        0
    });
    sim.start(p);
    sim.run();
    assert_eq!(sim.pool_holder_count(pool), 0);
}

#[test]
fn test_pool_blocking_acquire_waits_for_release() {
    let sim = Sim::new();
    let pool = sim.create_pool("cpus", 4);
    let hog = sim.spawn("hog", 0, move |sim| {
        assert!(sim.pool_acquire(pool, 4).is_success());
        sim.hold(3.0);
        sim.pool_release(pool, 4);
        0
    });
    let late = sim.spawn("late", 0, move |sim| {
        sim.hold(1.0);
        assert!(sim.pool_acquire(pool, 2).is_success());
        let t = sim.now() as i64;
        sim.pool_release(pool, 2);
        t
    });
    sim.start(hog);
    sim.start(late);
    sim.run();
    assert_eq!(sim.exit_value(late), 3);
    assert_eq!(sim.pool_in_use(pool), 0);
}

#[test]
fn test_pool_exit_releases_held_units() {
    // exit は保持資源を自動返却し、待機者が進めるようになる
    let sim = Sim::new();
    let pool = sim.create_pool("cpus", 2);
    let holder = sim.spawn("holder", 0, move |sim| {
        assert!(sim.pool_acquire(pool, 2).is_success());
        sim.hold(1.0);
        7 // release せずに終了
    });
    let waiter = sim.spawn("waiter", 0, move |sim| {
        assert!(sim.pool_acquire(pool, 1).is_success());
        let t = sim.now() as i64;
        sim.pool_release(pool, 1);
        t
    });
    sim.start(holder);
    sim.start(waiter);
    sim.run();
    assert_eq!(sim.exit_value(waiter), 1);
    assert_eq!(sim.pool_in_use(pool), 0);
    assert_eq!(sim.pool_holder_count(pool), 0);
}

#[test]
fn test_pool_interrupted_acquire_rolls_back() {
    let sim = Sim::new();
    let pool = sim.create_pool("cpus", 4);
    let hog = sim.spawn("hog", 0, move |sim| {
        assert!(sim.pool_acquire(pool, 3).is_success());
        sim.hold(10.0);
        sim.pool_release(pool, 3);
        0
    });
    let greedy = sim.spawn("greedy", 0, move |sim| {
        // 1 単位だけ取れて残り 2 を待つ → 割り込みで全部手放す
        let s = sim.pool_acquire(pool, 3);
        assert_eq!(s, Signal::user(9));
        let me = sim.current_process().unwrap();
        assert_eq!(sim.pool_held_by(pool, me), 0, "partial holding must be rolled back");
        sim.now() as i64
    });
    let poker = sim.spawn("poker", 0, move |sim| {
        sim.hold(1.0);
        sim.interrupt(greedy, Signal::user(9), 0);
        0
    });
    sim.start(hog);
    sim.start(greedy);
    sim.start(poker);
    sim.run();
    assert_eq!(sim.exit_value(greedy), 1);
    assert_eq!(sim.pool_in_use(pool), 0);
}

#[test]
fn test_pool_preempt_scenario() {
    // S5: 容量4、低優先度が3保持+1要求中、高優先度が t=1 に preempt(4)
    let sim = Sim::new();
    let pool = sim.create_pool("cpus", 4);
    let low = sim.spawn("low", 0, move |sim| {
        assert!(sim.pool_acquire(pool, 3).is_success());
        let s = sim.pool_acquire(pool, 2);
        assert_eq!(s, Signal::PREEMPTED);
        let me = sim.current_process().unwrap();
        assert_eq!(sim.pool_held_by(pool, me), 0, "all units must be transferred away");
        sim.now() as i64
    });
    let high = sim.spawn("high", 5, move |sim| {
        sim.hold(1.0);
        assert!(sim.pool_preempt(pool, 4).is_success());
        let me = sim.current_process().unwrap();
        assert_eq!(sim.pool_held_by(pool, me), 4);
        assert_eq!(sim.pool_in_use(pool), 4);
        sim.pool_release(pool, 4);
        sim.now() as i64
    });
    sim.start(low);
    sim.start(high);
    sim.run();
    assert_eq!(sim.exit_value(low), 1, "preempted at t=1");
    assert_eq!(sim.exit_value(high), 1);
    assert_eq!(sim.pool_in_use(pool), 0);
    assert_eq!(sim.pool_holder_count(pool), 0);
}

#[test]
fn test_pool_preempt_does_not_touch_equal_priority() {
    let sim = Sim::new();
    let pool = sim.create_pool("cpus", 2);
    let holder = sim.spawn("holder", 3, move |sim| {
        assert!(sim.pool_acquire(pool, 2).is_success());
        sim.hold(5.0);
        sim.pool_release(pool, 2);
        sim.now() as i64
    });
    let rival = sim.spawn("rival", 3, move |sim| {
        sim.hold(1.0);
        // 同優先度は横取りできず、解放まで待つ
        assert!(sim.pool_preempt(pool, 1).is_success());
        let t = sim.now() as i64;
        sim.pool_release(pool, 1);
        t
    });
    sim.start(holder);
    sim.start(rival);
    sim.run();
    assert_eq!(sim.exit_value(holder), 5, "holder must run to completion");
    assert_eq!(sim.exit_value(rival), 5);
}

#[test]
fn test_pool_recording_tracks_usage() {
    let sim = Sim::new();
    let pool = sim.create_pool("cpus", 4);
    sim.pool_start_recording(pool);
    let p = sim.spawn("user", 0, move |sim| {
        sim.pool_acquire(pool, 2);
        sim.hold(1.0);
        sim.pool_release(pool, 2);
        0
    });
    sim.start(p);
    sim.run();
    let history = sim.pool_history(pool);
    assert!(history.len() >= 3, "initial + acquire + release samples");
    assert_eq!(history.first().map(|s| s.value), Some(0.0));
    assert_eq!(history.last().map(|s| s.value), Some(0.0));
    assert!(history.iter().any(|s| s.value == 2.0));
    assert!(history.windows(2).all(|w| w[0].time <= w[1].time));
    let trace = sim.pool_stop_recording(pool).expect("recording was on");
    assert_eq!(trace.len(), history.len());
    assert!(sim.pool_history(pool).is_empty(), "stop detaches the trace");
}

// =============================================================================
// buffer
// =============================================================================

#[test]
fn test_buffer_producer_blocks_until_consumed() {
    // S4: 容量3、producer put(5)、consumer get(5)、どちらも t=0
    let sim = Sim::new();
    let buf = sim.create_buffer("belt", 3);
    let producer = sim.spawn("producer", 0, move |sim| {
        let mut amount = 5;
        let s = sim.buffer_put(buf, &mut amount);
        assert!(s.is_success());
        assert_eq!(amount, 5);
        0
    });
    let consumer = sim.spawn("consumer", 0, move |sim| {
        let mut amount = 5;
        let s = sim.buffer_get(buf, &mut amount);
        assert!(s.is_success());
        assert_eq!(amount, 5);
        0
    });
    sim.start(producer);
    sim.start(consumer);
    sim.run();
    assert_eq!(sim.buffer_level(buf), 0);
    assert_eq!(sim.status(producer), ProcessStatus::Finished);
    assert_eq!(sim.status(consumer), ProcessStatus::Finished);
}

#[test]
fn test_buffer_get_blocks_on_empty() {
    let sim = Sim::new();
    let buf = sim.create_buffer("belt", 10);
    let consumer = sim.spawn("consumer", 0, move |sim| {
        let mut amount = 4;
        assert!(sim.buffer_get(buf, &mut amount).is_success());
        sim.now() as i64
    });
    let producer = sim.spawn("producer", 0, move |sim| {
        sim.hold(2.0);
        let mut amount = 4;
        assert!(sim.buffer_put(buf, &mut amount).is_success());
        0
    });
    sim.start(consumer);
    sim.start(producer);
    sim.run();
    assert_eq!(sim.exit_value(consumer), 2);
    assert_eq!(sim.buffer_level(buf), 0);
}

#[test]
fn test_buffer_interrupt_returns_partial_amount() {
    let sim = Sim::new();
    let buf = sim.create_buffer("belt", 10);
    let consumer = sim.spawn("consumer", 0, move |sim| {
        let mut amount = 5;
        let s = sim.buffer_get(buf, &mut amount);
        assert_eq!(s, Signal::user(9));
        amount as i64 // 部分転送量
    });
    let producer = sim.spawn("producer", 0, move |sim| {
        sim.hold(1.0);
        let mut amount = 2;
        assert!(sim.buffer_put(buf, &mut amount).is_success());
        0
    });
    let poker = sim.spawn("poker", 0, move |sim| {
        sim.hold(2.0);
        sim.interrupt(consumer, Signal::user(9), 0);
        0
    });
    sim.start(consumer);
    sim.start(producer);
    sim.start(poker);
    sim.run();
    assert_eq!(sim.exit_value(consumer), 2, "2 of 5 units were transferred");
    assert_eq!(sim.buffer_level(buf), 0);
}

#[test]
fn test_buffer_level_stays_within_bounds() {
    let sim = Sim::new();
    let buf = sim.create_buffer("belt", 3);
    sim.buffer_start_recording(buf);
    let producer = sim.spawn("producer", 0, move |sim| {
        for _ in 0..4 {
            let mut amount = 2;
            assert!(sim.buffer_put(buf, &mut amount).is_success());
            sim.hold(1.0);
        }
        0
    });
    let consumer = sim.spawn("consumer", 0, move |sim| {
        for _ in 0..4 {
            let mut amount = 2;
            assert!(sim.buffer_get(buf, &mut amount).is_success());
            sim.hold(0.5);
        }
        0
    });
    sim.start(producer);
    sim.start(consumer);
    sim.run();
    let history = sim.buffer_history(buf);
    assert!(!history.is_empty());
    assert!(history.iter().all(|s| (0.0..=3.0).contains(&s.value)));
    assert_eq!(sim.buffer_level(buf), 0);
}

// =============================================================================
// 条件変数
// =============================================================================

#[test]
fn test_condition_wakes_only_satisfied_waiters() {
    // S6: x>=1 と x>=2 の待機者、signaller が x=1 で signal
    let sim = Sim::new();
    let cond = sim.create_condition("threshold");
    let x = Rc::new(Cell::new(0_i64));

    let x1 = x.clone();
    let w1 = sim.spawn("w1", 0, move |sim| {
        while x1.get() < 1 {
            let x = x1.clone();
            let s = sim.condition_wait(cond, move || x.get() >= 1);
            assert!(s.is_success());
        }
        // 覚醒後の再検査を通過した
        sim.now() as i64
    });
    let x2 = x.clone();
    let w2 = sim.spawn("w2", 0, move |sim| {
        while x2.get() < 2 {
            let x = x2.clone();
            sim.condition_wait(cond, move || x.get() >= 2);
        }
        0
    });
    let xs = x.clone();
    let signaller = sim.spawn("signaller", 0, move |sim| {
        sim.hold(1.0);
        xs.set(1);
        i64::from(sim.condition_signal(cond))
    });
    sim.start(w1);
    sim.start(w2);
    sim.start(signaller);
    sim.run();
    assert_eq!(sim.status(w1), ProcessStatus::Finished);
    assert_eq!(sim.exit_value(w1), 1);
    assert_eq!(sim.exit_value(signaller), 1, "signal resumed someone");
    assert_eq!(sim.status(w2), ProcessStatus::Running, "w2's predicate stayed false");
}

#[test]
fn test_condition_signal_with_no_waiters() {
    let sim = Sim::new();
    let cond = sim.create_condition("idle");
    let p = sim.spawn("p", 0, move |sim| i64::from(sim.condition_signal(cond)));
    sim.start(p);
    sim.run();
    assert_eq!(sim.exit_value(p), 0);
}

#[test]
fn test_condition_observes_pool_release() {
    // observer 連鎖: pool の release → pool guard → 条件変数 guard
    let sim = Sim::new();
    let pool = sim.create_pool("cpus", 2);
    let cond = sim.create_condition("drained");
    sim.register_observer(sim.pool_guard(pool), sim.condition_guard(cond));

    let done = Rc::new(Cell::new(false));
    let done_w = done.clone();
    let watcher = sim.spawn("watcher", 0, move |sim| {
        while !done_w.get() {
            let d = done_w.clone();
            sim.condition_wait(cond, move || d.get());
        }
        sim.now() as i64
    });
    let done_u = done.clone();
    let user = sim.spawn("user", 0, move |sim| {
        assert!(sim.pool_acquire(pool, 1).is_success());
        sim.hold(3.0);
        done_u.set(true);
        sim.pool_release(pool, 1);
        0
    });
    sim.start(watcher);
    sim.start(user);
    sim.run();
    assert_eq!(sim.status(watcher), ProcessStatus::Finished);
    assert_eq!(sim.exit_value(watcher), 3, "woken through the observer chain");
}

// =============================================================================
// guard の公開操作
// =============================================================================

#[test]
fn test_guard_cancel_wakes_with_cancelled() {
    let sim = Sim::new();
    let pool = sim.create_pool("cpus", 1);
    let hog = sim.spawn("hog", 0, move |sim| {
        assert!(sim.pool_acquire(pool, 1).is_success());
        sim.hold(10.0);
        sim.pool_release(pool, 1);
        0
    });
    let waiter = sim.spawn("waiter", 0, move |sim| {
        let s = sim.pool_acquire(pool, 1);
        assert_eq!(s, Signal::CANCELLED);
        sim.now() as i64
    });
    let canceller = sim.spawn("canceller", 0, move |sim| {
        sim.hold(1.0);
        assert!(sim.guard_cancel(sim.pool_guard(pool), waiter));
        0
    });
    sim.start(hog);
    sim.start(waiter);
    sim.start(canceller);
    sim.run();
    assert_eq!(sim.exit_value(waiter), 1);
    assert_eq!(sim.pool_in_use(pool), 0);
}

#[test]
fn test_unregister_observer_stops_forwarding() {
    let sim = Sim::new();
    let pool = sim.create_pool("cpus", 1);
    let cond = sim.create_condition("watch");
    let pg = sim.pool_guard(pool);
    let cg = sim.condition_guard(cond);
    sim.register_observer(pg, cg);
    assert!(sim.unregister_observer(pg, cg));
    assert!(!sim.unregister_observer(pg, cg), "second unregister reports not-found");
}

#[test]
fn test_anti_starvation_front_gets_freed_units_first() {
    // 解放された 1 単位は、全量を満たせる後続（small）ではなく
    // 先頭（big）に渡る。signal は先頭を追い越さない。
    let sim = Sim::new();
    let pool = sim.create_pool("cpus", 4);

    let hog = sim.spawn("hog", 0, move |sim| {
        assert!(sim.pool_acquire(pool, 4).is_success());
        sim.hold(2.0);
        sim.pool_release(pool, 1);
        sim.hold(2.0);
        sim.pool_release(pool, 3);
        0
    });
    let big = sim.spawn("big", 0, move |sim| {
        sim.hold(1.0);
        assert!(sim.pool_acquire(pool, 3).is_success());
        sim.pool_release(pool, 3);
        0
    });
    let small = sim.spawn("small", 0, move |sim| {
        sim.hold(1.5);
        assert!(sim.pool_acquire(pool, 1).is_success());
        sim.pool_release(pool, 1);
        0
    });
    let probe = sim.spawn("probe", 0, move |sim| {
        sim.hold(3.0);
        // t=2 に空いた 1 単位は先頭の big が部分獲得している。
        // 1 単位で足りる small が追い越して取ることはない。
        assert_eq!(sim.pool_held_by(pool, big), 1);
        assert_eq!(sim.pool_held_by(pool, small), 0);
        assert_eq!(sim.pool_in_use(pool), 4);
        0
    });
    sim.start(hog);
    sim.start(big);
    sim.start(small);
    sim.start(probe);
    sim.run();
    assert_eq!(sim.status(probe), ProcessStatus::Finished);
    assert_eq!(sim.status(big), ProcessStatus::Finished);
    assert_eq!(sim.status(small), ProcessStatus::Finished);
    assert_eq!(sim.pool_in_use(pool), 0);
}
