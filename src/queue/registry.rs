//! アクティブコマンドレジストリ
//!
//! スロット番号で索引するアリーナ（`Vec<Option<Entry>>`、長さ = openings）。
//! タグからコマンドへの解決は O(1)、単一コマンド検索とタイムアウト走査は
//! 投入順（リカバリコマンドを先頭）に O(openings) で行う。
//!
//! `used` は可視のアクティブスロット、`hold` はリカバリ中に退避した
//! スロット。退避中のエントリはアリーナに残るが、検索からは見えない。

use alloc::sync::Arc;
use alloc::vec::Vec;

use super::types::{DriveId, Slot, SlotMask};
use super::xfer::Xfer;

struct Entry<T> {
    xfer: Arc<Xfer<T>>,
    seq: u64,
}

impl<T> Entry<T> {
    /// 並び順キー: リカバリコマンドが先、次に投入順
    fn order_key(&self) -> (bool, u64) {
        (!self.xfer.is_recovery(), self.seq)
    }
}

/// アクティブコマンドレジストリ
pub struct ActiveXfers<T> {
    entries: Vec<Option<Entry<T>>>,
    used: SlotMask,
    hold: SlotMask,
    next_seq: u64,
}

impl<T> ActiveXfers<T> {
    pub fn new(openings: u8) -> Self {
        let mut entries = Vec::with_capacity(openings as usize);
        entries.resize_with(openings as usize, || None);
        Self {
            entries,
            used: SlotMask::EMPTY,
            hold: SlotMask::EMPTY,
            next_seq: 0,
        }
    }

    pub fn used(&self) -> SlotMask {
        self.used
    }

    pub fn hold(&self) -> SlotMask {
        self.hold
    }

    /// 可視のアクティブコマンド数
    pub fn visible_count(&self) -> usize {
        self.used.count() as usize
    }

    /// 退避分も含めて空か
    pub fn is_empty(&self) -> bool {
        self.used.union(self.hold).is_empty()
    }

    /// スロットにコマンドを登録する
    ///
    /// # Panics
    /// スロットが既に使用中または退避中の場合。
    pub fn activate(&mut self, slot: Slot, xfer: Arc<Xfer<T>>) {
        assert!(
            !self.used.union(self.hold).contains(slot),
            "slot {} activated twice",
            slot
        );
        let entry = &mut self.entries[slot.as_usize()];
        assert!(entry.is_none(), "registry entry for slot {} not empty", slot);

        xfer.bind_slot(slot);
        *entry = Some(Entry {
            xfer,
            seq: self.next_seq,
        });
        self.next_seq += 1;
        self.used.insert(slot);
    }

    /// スロットからコマンドを外す
    ///
    /// # Panics
    /// スロットが可視のアクティブ集合にない場合。
    pub fn deactivate(&mut self, slot: Slot) -> Arc<Xfer<T>> {
        assert!(self.used.contains(slot), "slot {} is not active", slot);
        self.used.remove(slot);
        match self.entries[slot.as_usize()].take() {
            Some(entry) => {
                entry.xfer.unbind_slot();
                entry.xfer
            }
            None => panic!("used slot {} has no registry entry", slot),
        }
    }

    /// 可視スロットのコマンド
    pub fn get(&self, slot: Slot) -> Option<&Arc<Xfer<T>>> {
        if !self.used.contains(slot) {
            return None;
        }
        self.entries[slot.as_usize()].as_ref().map(|e| &e.xfer)
    }

    /// 可視のアクティブコマンドを並び順で列挙
    pub fn visible(&self) -> Vec<&Arc<Xfer<T>>> {
        let mut entries: Vec<&Entry<T>> = self
            .used
            .iter()
            .filter_map(|slot| self.entries[slot.as_usize()].as_ref())
            .collect();
        entries.sort_unstable_by_key(|e| e.order_key());
        entries.into_iter().map(|e| &e.xfer).collect()
    }

    /// 並び順の先頭コマンド
    pub fn head(&self) -> Option<&Arc<Xfer<T>>> {
        self.used
            .iter()
            .filter_map(|slot| self.entries[slot.as_usize()].as_ref())
            .min_by_key(|e| e.order_key())
            .map(|e| &e.xfer)
    }

    /// 指定ドライブの最も古いアクティブコマンド
    pub fn by_drive(&self, drive: DriveId) -> Option<&Arc<Xfer<T>>> {
        self.used
            .iter()
            .filter_map(|slot| self.entries[slot.as_usize()].as_ref())
            .filter(|e| e.xfer.drive() == drive)
            .min_by_key(|e| e.order_key())
            .map(|e| &e.xfer)
    }

    /// 可視のアクティブスロットをすべて `hold` に退避する
    ///
    /// # Panics
    /// 既に退避中の場合（入れ子の hold は不可）。
    pub fn hold_all(&mut self) {
        assert!(self.hold.is_empty(), "nested hold: {:?} already held", self.hold);
        self.hold = self.used;
        self.used = SlotMask::EMPTY;
    }

    /// 退避したスロットを `used` に戻す
    pub fn release_hold(&mut self) {
        debug_assert!(self.used.intersection(self.hold).is_empty());
        self.used = self.used.union(self.hold);
        self.hold = SlotMask::EMPTY;
    }

    /// 退避分も含めて全エントリを取り出し、空にする
    pub fn drain(&mut self) -> Vec<Arc<Xfer<T>>> {
        let mut entries: Vec<Entry<T>> = self.entries.iter_mut().filter_map(Option::take).collect();
        entries.sort_unstable_by_key(|e| e.order_key());
        self.used = SlotMask::EMPTY;
        self.hold = SlotMask::EMPTY;
        entries
            .into_iter()
            .map(|e| {
                e.xfer.unbind_slot();
                e.xfer
            })
            .collect()
    }

    /// アリーナのエントリ有無が `used ∪ hold` と一致するか
    pub fn is_consistent(&self) -> bool {
        let live = self.used.union(self.hold);
        self.entries.iter().enumerate().all(|(i, entry)| {
            let slot = Slot(i as u8);
            match entry {
                Some(e) => live.contains(slot) && e.xfer.slot() == Some(slot),
                None => !live.contains(slot),
            }
        })
    }
}
