//! pqueue モジュールのテスト

use rand::Rng;
use rand::SeedableRng;
use rand_xoshiro::Xoshiro256PlusPlus;

use super::{PrioQueue, calendar_order, victim_order, waiting_order};
use crate::types::Handle;

fn q() -> PrioQueue<u64> {
    PrioQueue::new(calendar_order::<u64>)
}

#[test]
fn test_empty_queue() {
    let queue = q();
    assert!(queue.is_empty());
    assert_eq!(queue.len(), 0);
    assert_eq!(queue.capacity(), 8);
    assert!(queue.peek().is_none());
    queue.validate();
}

#[test]
fn test_enqueue_issues_monotonic_handles() {
    let mut queue = q();
    let h1 = queue.enqueue(0, 1.0, 0, 0);
    let h2 = queue.enqueue(0, 2.0, 0, 0);
    let h3 = queue.enqueue(0, 0.5, 0, 0);
    assert!(h1.is_some() && h2.is_some() && h3.is_some());
    assert!(h1 < h2 && h2 < h3);
    queue.validate();
}

#[test]
fn test_dequeue_returns_calendar_order() {
    // 時刻昇順 → 優先度降順 → FIFO
    let mut queue = q();
    queue.enqueue(1, 5.0, 0, 0);
    queue.enqueue(2, 2.0, 0, 0);
    queue.enqueue(3, 5.0, 1, 0);
    let order: Vec<u64> = std::iter::from_fn(|| queue.dequeue().map(|t| t.payload)).collect();
    assert_eq!(order, vec![2, 3, 1]);
}

#[test]
fn test_same_key_is_fifo() {
    let mut queue = q();
    for i in 0..16u64 {
        queue.enqueue(i, 1.0, 0, 0);
    }
    let order: Vec<u64> = std::iter::from_fn(|| queue.dequeue().map(|t| t.payload)).collect();
    assert_eq!(order, (0..16).collect::<Vec<_>>());
}

#[test]
fn test_cancel_removes_entry() {
    let mut queue = q();
    let h1 = queue.enqueue(1, 1.0, 0, 0);
    let h2 = queue.enqueue(2, 2.0, 0, 0);
    assert!(queue.cancel(h1));
    assert!(!queue.cancel(h1), "double cancel must report not-found");
    assert!(queue.contains(h2));
    assert!(!queue.contains(h1));
    assert_eq!(queue.len(), 1);
    queue.validate();
}

#[test]
fn test_cancel_unknown_handle() {
    let mut queue = q();
    assert!(!queue.cancel(Handle::NONE));
    assert!(!queue.cancel(Handle::new(12345)));
}

#[test]
fn test_schedule_cancel_round_trip() {
    // enqueue → cancel でキューが元の状態（消費ハンドルを除く）に戻る
    let mut queue = q();
    queue.enqueue(1, 1.0, 0, 0);
    let before: Vec<u64> = queue.iter().map(|t| t.handle.raw()).collect();
    let h = queue.enqueue(2, 0.5, 0, 0);
    assert!(queue.cancel(h));
    let after: Vec<u64> = queue.iter().map(|t| t.handle.raw()).collect();
    assert_eq!(before, after);
    queue.validate();
}

#[test]
fn test_reprioritize_moves_entry() {
    let mut queue = q();
    let h1 = queue.enqueue(1, 10.0, 0, 0);
    queue.enqueue(2, 5.0, 0, 0);
    assert!(queue.reprioritize(h1, 1.0, 0, 0));
    assert_eq!(queue.peek().map(|t| t.payload), Some(1));
    // 後方への移動
    assert!(queue.reprioritize(h1, 99.0, 0, 0));
    assert_eq!(queue.peek().map(|t| t.payload), Some(2));
    queue.validate();
}

#[test]
fn test_payload_mut() {
    let mut queue = q();
    let h = queue.enqueue(1, 1.0, 0, 0);
    *queue.payload_mut(h).unwrap() = 42;
    assert_eq!(queue.get(h).map(|t| t.payload), Some(42));
}

#[test]
fn test_growth_preserves_entries() {
    let mut queue = q();
    let handles: Vec<Handle> = (0..100u64).map(|i| queue.enqueue(i, i as f64, 0, 0)).collect();
    assert!(queue.capacity() >= 128);
    queue.validate();
    for (i, h) in handles.iter().enumerate() {
        assert_eq!(queue.get(*h).map(|t| t.payload), Some(i as u64));
    }
}

#[test]
fn test_clear() {
    let mut queue = q();
    let h_before = queue.enqueue(1, 1.0, 0, 0);
    queue.clear();
    assert!(queue.is_empty());
    assert!(!queue.contains(h_before));
    // ハンドル発行は継続して単調
    let h_after = queue.enqueue(2, 1.0, 0, 0);
    assert!(h_after > h_before);
    queue.validate();
}

#[test]
fn test_tombstone_churn_stays_consistent() {
    // enqueue/cancel を繰り返しても hash が破綻しないこと
    let mut queue = q();
    let mut live: Vec<Handle> = Vec::new();
    for round in 0..200u64 {
        let h = queue.enqueue(round, round as f64, 0, 0);
        live.push(h);
        if round % 3 == 0 {
            let victim = live.remove(0);
            assert!(queue.cancel(victim));
        }
        queue.validate();
    }
    for h in &live {
        assert!(queue.contains(*h));
    }
}

#[test]
fn test_waiting_order_priority_desc_fifo() {
    let mut queue: PrioQueue<u64> = PrioQueue::new(waiting_order::<u64>);
    queue.enqueue(1, 0.0, 5, 0);
    queue.enqueue(2, 0.0, 9, 0);
    queue.enqueue(3, 0.0, 9, 0);
    let order: Vec<u64> = std::iter::from_fn(|| queue.dequeue().map(|t| t.payload)).collect();
    assert_eq!(order, vec![2, 3, 1], "priority desc, then FIFO");
}

#[test]
fn test_victim_order_low_priority_latest_first() {
    let mut queue: PrioQueue<u64> = PrioQueue::new(victim_order::<u64>);
    queue.enqueue(1, 0.0, 5, 0);
    queue.enqueue(2, 0.0, 1, 0);
    queue.enqueue(3, 0.0, 1, 0);
    let order: Vec<u64> = std::iter::from_fn(|| queue.dequeue().map(|t| t.payload)).collect();
    assert_eq!(order, vec![3, 2, 1], "lowest priority and latest arrival first");
}

/// ランダム鍵による順序性のプロパティテスト
///
/// 乱数は固定シードの Xoshiro256PlusPlus。比較関数の定める順序で
/// dequeue が全要素を整列して返すことを確認する。
#[test]
fn test_random_keys_dequeue_sorted() {
    let mut rng = Xoshiro256PlusPlus::seed_from_u64(0x5EED);
    for _ in 0..20 {
        let mut queue = q();
        let n: u64 = rng.random_range(1..300);
        for i in 0..n {
            let dkey = rng.random_range(0.0..100.0);
            let ikey = rng.random_range(-3i64..3);
            queue.enqueue(i, dkey, ikey, 0);
        }
        queue.validate();
        let mut prev: Option<(f64, i64, Handle)> = None;
        while let Some(tag) = queue.dequeue() {
            if let Some((pd, pi, ph)) = prev {
                let ordered = pd < tag.dkey
                    || (pd == tag.dkey && pi > tag.ikey)
                    || (pd == tag.dkey && pi == tag.ikey && ph < tag.handle);
                assert!(ordered, "dequeue out of order: ({pd},{pi}) then ({},{})", tag.dkey, tag.ikey);
            }
            prev = Some((tag.dkey, tag.ikey, tag.handle));
        }
    }
}

/// ランダムな enqueue / cancel / reprioritize の混合負荷
#[test]
fn test_random_mixed_operations() {
    let mut rng = Xoshiro256PlusPlus::seed_from_u64(0xC0FFEE);
    let mut queue = q();
    let mut live: Vec<Handle> = Vec::new();
    for step in 0..2000u64 {
        match rng.random_range(0..4) {
            0 | 1 => {
                let h = queue.enqueue(step, rng.random_range(0.0..50.0), rng.random_range(-5i64..5), 0);
                live.push(h);
            }
            2 if !live.is_empty() => {
                let i = rng.random_range(0..live.len());
                let h = live.swap_remove(i);
                assert!(queue.cancel(h));
            }
            3 if !live.is_empty() => {
                let i = rng.random_range(0..live.len());
                assert!(queue.reprioritize(
                    live[i],
                    rng.random_range(0.0..50.0),
                    rng.random_range(-5i64..5),
                    0
                ));
            }
            _ => {}
        }
        if step % 64 == 0 {
            queue.validate();
        }
    }
    queue.validate();
    assert_eq!(queue.len(), live.len());
}
