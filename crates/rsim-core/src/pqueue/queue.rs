//! PrioQueue 本体
//!
//! - heap: 0-indexed の binary min-heap（比較関数は strict weak ordering）
//! - hash: handle → heap 位置の open-addressing 表
//! - 両者の相互参照（tag.hash_index / slot.heap_ref）を swap のたびに維持する

use super::{FIB_MULT, INITIAL_HEAP_EXP, MAX_HEAP_EXP};
use crate::types::Handle;

/// 比較関数。`compare(a, b) == true` のとき a が b に先行する。
pub type CompareFn<T> = fn(&HeapTag<T>, &HeapTag<T>) -> bool;

/// heap エントリ
///
/// 3つの鍵の意味はクライアントが決める。カレンダーは dkey=時刻 /
/// ikey=優先度、待ち行列は ikey=優先度のみ、保持者キューは ikey=優先度 /
/// ukey=プロセス識別子、といった具合。
#[derive(Debug, Clone, Copy)]
pub struct HeapTag<T: Copy> {
    /// このエントリの安定識別子
    pub handle: Handle,
    /// hash 表上の自分のスロット位置（逆参照）
    hash_index: u32,
    /// 実数鍵
    pub dkey: f64,
    /// 整数鍵
    pub ikey: i64,
    /// 符号なし整数鍵
    pub ukey: u64,
    /// クライアント定義ペイロード
    pub payload: T,
}

/// hash スロット
///
/// `heap_ref` は heap 位置 + 1。0 は「削除済み (tombstone)」を表し、
/// `handle == 0` のスロットだけが真に空。probe は tombstone を素通りし、
/// 空きスロットで停止する。
#[derive(Debug, Clone, Copy, Default)]
struct HashSlot {
    handle: u64,
    heap_ref: u32,
}

impl HashSlot {
    #[inline]
    fn is_empty(&self) -> bool {
        self.handle == 0
    }

    #[inline]
    fn is_tombstone(&self) -> bool {
        self.handle != 0 && self.heap_ref == 0
    }
}

/// heap + hash 複合優先度付きキュー
///
/// enqueue が発行するハンドルは単調増加で再利用されない。
/// すべての操作は単一スレッド前提（シミュレーションインスタンス内専用）。
pub struct PrioQueue<T: Copy> {
    heap: Vec<HeapTag<T>>,
    heap_exp: u32,
    hash: Vec<HashSlot>,
    tombstones: usize,
    compare: CompareFn<T>,
    next_handle: u64,
}

impl<T: Copy> PrioQueue<T> {
    /// 比較関数を指定して生成（初期容量 8）
    pub fn new(compare: CompareFn<T>) -> Self {
        Self {
            heap: Vec::with_capacity(1 << INITIAL_HEAP_EXP),
            heap_exp: INITIAL_HEAP_EXP,
            hash: vec![HashSlot::default(); 1 << (INITIAL_HEAP_EXP + 1)],
            tombstones: 0,
            compare,
            next_handle: 1,
        }
    }

    /// 現在の要素数
    #[inline]
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    /// 空かどうか
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// 現在の heap 容量
    #[inline]
    pub fn capacity(&self) -> usize {
        1 << self.heap_exp
    }

    // =========================================================================
    // hash 内部
    // =========================================================================

    #[inline]
    fn hash_mask(&self) -> usize {
        self.hash.len() - 1
    }

    #[inline]
    fn hash_bits(&self) -> u32 {
        self.heap_exp + 1
    }

    #[inline]
    fn hash_start(&self, handle: u64) -> usize {
        (handle.wrapping_mul(FIB_MULT) >> (64 - self.hash_bits())) as usize
    }

    /// handle の heap 位置を検索
    fn lookup(&self, handle: Handle) -> Option<usize> {
        if handle.is_none() {
            return None;
        }
        let raw = handle.raw();
        let mask = self.hash_mask();
        let mut i = self.hash_start(raw);
        loop {
            let slot = &self.hash[i];
            if slot.is_empty() {
                return None;
            }
            if slot.handle == raw && slot.heap_ref != 0 {
                return Some(slot.heap_ref as usize - 1);
            }
            i = (i + 1) & mask;
        }
    }

    /// 新規 handle 用のスロットを確保して位置を返す
    ///
    /// ハンドルは一意なので重複チェックは不要。最初に出会った tombstone を
    /// 再利用し、なければ空きスロットに置く。負荷率 < 0.5 が probe の
    /// 停止性を保証する。
    fn claim_slot(&mut self, handle: u64) -> usize {
        let mask = self.hash_mask();
        let mut i = self.hash_start(handle);
        let mut grave: Option<usize> = None;
        loop {
            let slot = &self.hash[i];
            if slot.is_empty() {
                let at = grave.unwrap_or(i);
                if grave.is_some() {
                    self.tombstones -= 1;
                }
                self.hash[at].handle = handle;
                return at;
            }
            if grave.is_none() && slot.is_tombstone() {
                grave = Some(i);
            }
            i = (i + 1) & mask;
        }
    }

    /// スロットを tombstone 化
    #[inline]
    fn kill_slot(&mut self, hash_index: u32) {
        debug_assert!(self.hash[hash_index as usize].heap_ref != 0);
        self.hash[hash_index as usize].heap_ref = 0;
        self.tombstones += 1;
    }

    /// heap[idx] の hash 逆参照を更新
    #[inline]
    fn update_ref(&mut self, idx: usize) {
        let hi = self.heap[idx].hash_index as usize;
        self.hash[hi].heap_ref = idx as u32 + 1;
    }

    /// tombstone が live 件数を圧迫してきたら hash を in-place 再構築する
    fn maybe_rebuild(&mut self) {
        if self.tombstones > self.hash.len() / 4 {
            self.rebuild_hash();
        }
    }

    /// hash 表を現在の heap 内容から作り直す（tombstone 一掃）
    fn rebuild_hash(&mut self) {
        for slot in &mut self.hash {
            *slot = HashSlot::default();
        }
        self.tombstones = 0;
        for idx in 0..self.heap.len() {
            let handle = self.heap[idx].handle.raw();
            let at = self.claim_slot(handle);
            self.heap[idx].hash_index = at as u32;
            self.hash[at].heap_ref = idx as u32 + 1;
        }
    }

    // =========================================================================
    // heap 内部
    // =========================================================================

    #[inline]
    fn before(&self, a: usize, b: usize) -> bool {
        (self.compare)(&self.heap[a], &self.heap[b])
    }

    fn swap_tags(&mut self, a: usize, b: usize) {
        self.heap.swap(a, b);
        self.update_ref(a);
        self.update_ref(b);
    }

    fn sift_up(&mut self, mut idx: usize) {
        while idx > 0 {
            let parent = (idx - 1) / 2;
            if self.before(idx, parent) {
                self.swap_tags(idx, parent);
                idx = parent;
            } else {
                break;
            }
        }
    }

    fn sift_down(&mut self, mut idx: usize) {
        let len = self.heap.len();
        loop {
            let left = 2 * idx + 1;
            if left >= len {
                break;
            }
            let right = left + 1;
            let mut best = left;
            if right < len && self.before(right, left) {
                best = right;
            }
            if self.before(best, idx) {
                self.swap_tags(best, idx);
                idx = best;
            } else {
                break;
            }
        }
    }

    /// 比較結果に応じて上下どちらかへ sift
    fn sift_fix(&mut self, idx: usize) {
        if idx > 0 && self.before(idx, (idx - 1) / 2) {
            self.sift_up(idx);
        } else {
            self.sift_down(idx);
        }
    }

    /// 容量を倍増し hash を再構築する
    fn grow(&mut self) {
        assert!(
            self.heap_exp < MAX_HEAP_EXP,
            "priority queue exceeded 2^{MAX_HEAP_EXP} entries"
        );
        self.heap_exp += 1;
        self.heap.reserve(self.capacity() - self.heap.len());
        self.hash = vec![HashSlot::default(); 1 << (self.heap_exp + 1)];
        self.rebuild_hash();
    }

    // =========================================================================
    // 公開操作
    // =========================================================================

    /// エントリを追加し、新しいハンドルを返す
    pub fn enqueue(&mut self, payload: T, dkey: f64, ikey: i64, ukey: u64) -> Handle {
        if self.heap.len() == self.capacity() {
            self.grow();
        }
        let handle = Handle::new(self.next_handle);
        self.next_handle += 1;

        let at = self.claim_slot(handle.raw());
        let idx = self.heap.len();
        self.heap.push(HeapTag {
            handle,
            hash_index: at as u32,
            dkey,
            ikey,
            ukey,
            payload,
        });
        self.hash[at].heap_ref = idx as u32 + 1;
        self.sift_up(idx);
        handle
    }

    /// 先頭（compare 順で最小）のエントリを取り出す
    pub fn dequeue(&mut self) -> Option<HeapTag<T>> {
        if self.heap.is_empty() {
            return None;
        }
        let last = self.heap.len() - 1;
        self.heap.swap(0, last);
        let tag = self.heap.pop().expect("non-empty heap");
        self.kill_slot(tag.hash_index);
        if !self.heap.is_empty() {
            self.update_ref(0);
            self.sift_down(0);
        }
        self.maybe_rebuild();
        Some(tag)
    }

    /// 先頭のエントリを覗く
    #[inline]
    pub fn peek(&self) -> Option<&HeapTag<T>> {
        self.heap.first()
    }

    /// 先頭の実数鍵
    #[inline]
    pub fn peek_dkey(&self) -> Option<f64> {
        self.heap.first().map(|t| t.dkey)
    }

    /// 先頭の整数鍵
    #[inline]
    pub fn peek_ikey(&self) -> Option<i64> {
        self.heap.first().map(|t| t.ikey)
    }

    /// 先頭の符号なし鍵
    #[inline]
    pub fn peek_ukey(&self) -> Option<u64> {
        self.heap.first().map(|t| t.ukey)
    }

    /// ハンドル指定でエントリを参照
    #[inline]
    pub fn get(&self, handle: Handle) -> Option<&HeapTag<T>> {
        self.lookup(handle).map(|idx| &self.heap[idx])
    }

    /// ハンドル指定でペイロードを可変参照
    ///
    /// 鍵の変更は [`PrioQueue::reprioritize`] 経由でのみ行えるよう、
    /// ペイロードだけを返す。
    #[inline]
    pub fn payload_mut(&mut self, handle: Handle) -> Option<&mut T> {
        self.lookup(handle).map(|idx| &mut self.heap[idx].payload)
    }

    /// ハンドルが生きているか
    #[inline]
    pub fn contains(&self, handle: Handle) -> bool {
        self.lookup(handle).is_some()
    }

    /// エントリを取り消す
    ///
    /// 見つからなければ false（相手側が先に片付けたケースは正当な競合）。
    pub fn cancel(&mut self, handle: Handle) -> bool {
        let Some(idx) = self.lookup(handle) else {
            return false;
        };
        let last = self.heap.len() - 1;
        self.kill_slot(self.heap[idx].hash_index);
        if idx == last {
            self.heap.pop();
        } else {
            self.heap.swap(idx, last);
            self.heap.pop();
            self.update_ref(idx);
            self.sift_fix(idx);
        }
        self.maybe_rebuild();
        true
    }

    /// 鍵を書き換えて位置を修正する
    ///
    /// 旧タグとの比較で sift 方向を決める。見つからなければ false。
    pub fn reprioritize(&mut self, handle: Handle, dkey: f64, ikey: i64, ukey: u64) -> bool {
        let Some(idx) = self.lookup(handle) else {
            return false;
        };
        let old = self.heap[idx];
        {
            let tag = &mut self.heap[idx];
            tag.dkey = dkey;
            tag.ikey = ikey;
            tag.ukey = ukey;
        }
        if (self.compare)(&self.heap[idx], &old) {
            self.sift_up(idx);
        } else {
            self.sift_down(idx);
        }
        true
    }

    /// live エントリの走査（heap 順、整列保証なし）
    pub fn iter(&self) -> impl Iterator<Item = &HeapTag<T>> {
        self.heap.iter()
    }

    /// 全エントリを捨てて初期状態に戻す（ハンドル発行番号は維持）
    pub fn clear(&mut self) {
        self.heap.clear();
        for slot in &mut self.hash {
            *slot = HashSlot::default();
        }
        self.tombstones = 0;
    }

    /// 不変条件の検査（テスト / debug ビルド用）
    ///
    /// - `hash_size == 2 × heap_size`、`heap_size == 2^heap_exp`
    /// - live 負荷率 < 0.5
    /// - heap 順序性（全非ルート要素で `!compare(child, parent)`）
    /// - tag.hash_index / slot.heap_ref の相互参照一貫性
    #[cfg(any(test, feature = "debug"))]
    pub fn validate(&self) {
        assert_eq!(self.hash.len(), 2 * self.capacity());
        assert_eq!(self.capacity(), 1usize << self.heap_exp);
        assert!(self.heap.len() * 2 <= self.hash.len(), "load factor >= 0.5");
        for idx in 0..self.heap.len() {
            let tag = &self.heap[idx];
            let slot = &self.hash[tag.hash_index as usize];
            assert_eq!(slot.handle, tag.handle.raw(), "hash back-reference broken");
            assert_eq!(slot.heap_ref as usize, idx + 1, "hash forward-reference broken");
            if idx > 0 {
                let parent = (idx - 1) / 2;
                assert!(
                    !(self.compare)(&self.heap[idx], &self.heap[parent]),
                    "heap order violated at index {idx}"
                );
            }
        }
    }
}

// =============================================================================
// 標準の順序付け
// =============================================================================

/// カレンダー順: 時刻昇順 → 優先度降順 → ハンドル昇順 (FIFO)
pub fn calendar_order<T: Copy>(a: &HeapTag<T>, b: &HeapTag<T>) -> bool {
    if a.dkey != b.dkey {
        return a.dkey < b.dkey;
    }
    if a.ikey != b.ikey {
        return a.ikey > b.ikey;
    }
    a.handle < b.handle
}

/// 待ち行列順: 優先度降順 → ハンドル昇順 (FIFO)
pub fn waiting_order<T: Copy>(a: &HeapTag<T>, b: &HeapTag<T>) -> bool {
    if a.ikey != b.ikey {
        return a.ikey > b.ikey;
    }
    a.handle < b.handle
}

/// 横取り犠牲者順: 優先度昇順 → ハンドル降順（低優先度・後着が先頭）
pub fn victim_order<T: Copy>(a: &HeapTag<T>, b: &HeapTag<T>) -> bool {
    if a.ikey != b.ikey {
        return a.ikey < b.ikey;
    }
    a.handle > b.handle
}
