//! スロットビットマスクアロケータ
//!
//! 空きハードウェアスロットを `avail` ビットマスクで管理する。
//! ドライブが受け付ける同時コマンド数がコントローラのスロット数より
//! 少ない場合は、探索範囲を下位 `drive_openings` ビットに制限する。

use crate::error::{QueueError, QueueResult};

use super::types::{Slot, SlotMask, MAX_OPENINGS};

/// スロットアロケータ
#[derive(Debug, Clone)]
pub struct SlotAllocator {
    openings: u8,
    avail: SlotMask,
}

impl SlotAllocator {
    /// 全スロットが空きの状態で作成
    pub fn new(openings: u8) -> QueueResult<Self> {
        if openings == 0 || openings > MAX_OPENINGS {
            return Err(QueueError::InvalidOpenings(openings));
        }
        Ok(Self {
            openings,
            avail: SlotMask::first(openings),
        })
    }

    pub fn openings(&self) -> u8 {
        self.openings
    }

    /// 空きスロット
    pub fn avail(&self) -> SlotMask {
        self.avail
    }

    /// 空きスロットを割り当てる
    ///
    /// 探索範囲は下位 `min(openings, drive_openings)` スロット。
    /// 常に最小番号の空きスロットを返す。空きがなければ `None`
    /// （キュー満杯はエラーではない）。
    pub fn alloc_slot(&mut self, drive_openings: u8) -> Option<Slot> {
        let limit = drive_openings.min(self.openings);
        let slot = self.avail.intersection(SlotMask::first(limit)).lowest()?;
        self.avail.remove(slot);
        Some(slot)
    }

    /// スロットを返却する
    ///
    /// # Panics
    /// 範囲外のスロット、または既に空きのスロット（二重解放）。
    pub fn free_slot(&mut self, slot: Slot) {
        assert!(
            slot.as_u8() < self.openings,
            "slot {} out of range (openings {})",
            slot,
            self.openings
        );
        assert!(!self.avail.contains(slot), "double free of slot {}", slot);
        self.avail.insert(slot);
    }

    /// 全スロットを空きに戻す
    pub fn reset(&mut self) {
        self.avail = SlotMask::first(self.openings);
    }
}
