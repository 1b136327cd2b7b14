//! チャネルキュー状態
//!
//! スロットアロケータとアクティブコマンドレジストリを束ね、
//! 不変条件を保ったまま投入・完了・退避・タイムアウト・リセットを行う。
//! このモジュールはロックを持たない。排他はチャネルロックが保証する。
//!
//! 不変条件:
//! - `avail`、`used`、`hold`、`timed_out` は互いに素で、合わせて下位 `openings` ビット
//! - `used ∪ hold` の各ビットにちょうど1つのコマンドが対応する
//! - `timed_out` のスロットにはコマンドが結び付いていない
//! - `openings` は作成後に変化しない
//!
//! タイムアウトしたコマンドはスロットから外され、すぐに再投入できる。
//! スロット自体は遅れて届くハードウェア完了を吸収するために隔離され、
//! その完了報告、次のタイマー満了、[`XferQueue::reclaim_timed_out`]、
//! リセットのいずれかで空きに戻る。

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;

use bitflags::bitflags;

use crate::error::{QueueError, QueueResult, XferStatus};

use super::registry::ActiveXfers;
use super::slot::SlotAllocator;
use super::types::{DriveId, Slot, SlotMask, SlotState};
use super::xfer::{Completion, Xfer};

bitflags! {
    /// キュー状態フラグ
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct QueueFlags: u8 {
        /// エラーリカバリ中（タイムアウト処理を抑止）
        const RECOVERING = 1 << 0;
        /// プロトコル違反で停止
        const HALTED = 1 << 1;
    }
}

/// チャネルキュー
pub struct XferQueue<T> {
    slots: SlotAllocator,
    active: ActiveXfers<T>,
    timed_out: SlotMask,
    freeze: u32,
    flags: QueueFlags,
}

impl<T> XferQueue<T> {
    /// 全スロット空きで作成
    pub fn new(openings: u8) -> QueueResult<Self> {
        let slots = SlotAllocator::new(openings)?;
        Ok(Self {
            slots,
            active: ActiveXfers::new(openings),
            timed_out: SlotMask::EMPTY,
            freeze: 0,
            flags: QueueFlags::empty(),
        })
    }

    pub fn openings(&self) -> u8 {
        self.slots.openings()
    }

    pub fn slot_state(&self) -> SlotState {
        SlotState {
            avail: self.slots.avail(),
            used: self.active.used(),
            hold: self.active.hold(),
            timed_out: self.timed_out,
        }
    }

    /// 可視のアクティブコマンド数
    pub fn active_count(&self) -> usize {
        self.active.visible_count()
    }

    /// 退避分も含めてアクティブなコマンドがないか
    ///
    /// 隔離中のスロットはコマンドを持たないので数えない。
    pub fn is_idle(&self) -> bool {
        self.active.is_empty()
    }

    /// 可視のアクティブコマンドがあるか
    pub fn has_pending(&self) -> bool {
        self.active.visible_count() > 0
    }

    /// タイマーを張っておく必要があるか
    ///
    /// 隔離スロットは次の満了で回収するので、それだけでも計時を続ける。
    pub fn needs_timer(&self) -> bool {
        self.has_pending() || !self.timed_out.is_empty()
    }

    // ------------------------------------------------------------------------
    // 凍結 / リカバリ / 停止
    // ------------------------------------------------------------------------

    pub fn freeze(&mut self) {
        self.freeze += 1;
    }

    /// # Panics
    /// 凍結されていない場合。
    pub fn thaw(&mut self) {
        assert!(self.freeze > 0, "thaw without matching freeze");
        self.freeze -= 1;
    }

    pub fn is_frozen(&self) -> bool {
        self.freeze > 0
    }

    pub fn freeze_count(&self) -> u32 {
        self.freeze
    }

    pub fn set_recovering(&mut self, recovering: bool) {
        self.flags.set(QueueFlags::RECOVERING, recovering);
    }

    pub fn is_recovering(&self) -> bool {
        self.flags.contains(QueueFlags::RECOVERING)
    }

    pub fn is_halted(&self) -> bool {
        self.flags.contains(QueueFlags::HALTED)
    }

    /// 不変条件違反: チャネルを停止してからパニックする
    fn violation(&mut self, args: fmt::Arguments<'_>) -> ! {
        self.flags.insert(QueueFlags::HALTED);
        log::error!("xfer queue protocol violation: {}", args);
        panic!("xfer queue protocol violation: {}", args);
    }

    // ------------------------------------------------------------------------
    // 投入 / 完了
    // ------------------------------------------------------------------------

    /// コマンドをスロットに割り当ててアクティブにする
    ///
    /// 失敗時は副作用なし。
    pub fn submit(&mut self, xfer: &Arc<Xfer<T>>, drive_openings: u8) -> QueueResult<Slot> {
        if self.is_halted() {
            return Err(QueueError::Halted);
        }
        if self.is_frozen() {
            return Err(QueueError::Frozen);
        }
        if drive_openings == 0 {
            return Err(QueueError::InvalidOpenings(drive_openings));
        }
        if !xfer.has_callback() {
            return Err(QueueError::NoCompletionHandler);
        }
        if let Some(slot) = xfer.slot() {
            self.violation(format_args!("command already active in slot {}", slot));
        }

        let slot = self
            .slots
            .alloc_slot(drive_openings)
            .ok_or(QueueError::QueueFull)?;
        xfer.clear_timed_out();
        self.active.activate(slot, Arc::clone(xfer));
        Ok(slot)
    }

    /// スロットのコマンドを完了させる
    ///
    /// 隔離中のスロットへの遅れた完了報告はスロットを解放するだけで
    /// `None` を返す（タイムアウト通知は既に済んでいる）。
    pub fn complete_slot(&mut self, slot: Slot, status: XferStatus) -> Option<Completion<T>> {
        if self.timed_out.contains(slot) {
            self.timed_out.remove(slot);
            self.slots.free_slot(slot);
            return None;
        }
        if !self.active.used().contains(slot) {
            self.violation(format_args!("completion for inactive slot {}", slot));
        }
        let xfer = self.active.deactivate(slot);
        self.slots.free_slot(slot);
        Some(Completion::new(xfer, status))
    }

    /// コマンドを指定して完了させる
    ///
    /// タイムアウト済みで再投入されていないコマンドは `None`。
    /// 元のスロットは隔離されたままで、次の満了で回収される。
    pub fn complete(&mut self, xfer: &Arc<Xfer<T>>, status: XferStatus) -> Option<Completion<T>> {
        let slot = match xfer.slot() {
            Some(slot) => slot,
            None if xfer.is_timed_out() => return None,
            None => self.violation(format_args!("completion for inactive command {:?}", xfer)),
        };
        let owns_slot = self
            .active
            .get(slot)
            .is_some_and(|active| Arc::ptr_eq(active, xfer));
        if !owns_slot {
            self.violation(format_args!("command {:?} does not own slot {}", xfer, slot));
        }
        self.complete_slot(slot, status)
    }

    // ------------------------------------------------------------------------
    // 検索
    // ------------------------------------------------------------------------

    /// タグからコマンドを解決する
    ///
    /// 隔離中のスロット（コマンドはタイムアウト済み）は `None`。
    /// 使用中でも隔離中でもないスロットはハードウェアのプロトコル違反として扱う。
    pub fn lookup_by_slot(&mut self, slot: Slot) -> Option<&Arc<Xfer<T>>> {
        if self.timed_out.contains(slot) {
            return None;
        }
        if slot.as_u8() >= self.openings() || !self.active.used().contains(slot) {
            self.violation(format_args!("hardware reported unknown slot {}", slot));
        }
        match self.active.get(slot) {
            Some(xfer) => Some(xfer),
            None => panic!("used slot {} has no registry entry", slot),
        }
    }

    /// 非タグ付きチャネルの唯一のアクティブコマンド
    ///
    /// 可視のコマンドがちょうど1つでなければ `None`（どれが完了したか
    /// 決められない）。その1つが NCQ コマンドの場合も `None`（タグで解決すべき）。
    pub fn lookup_single_active(&self) -> Option<&Arc<Xfer<T>>> {
        if self.active.visible_count() != 1 {
            return None;
        }
        self.active.head().filter(|head| !head.is_ncq())
    }

    /// 指定ドライブの最も古いアクティブコマンド
    pub fn lookup_drive_active(&self, drive: DriveId) -> Option<&Arc<Xfer<T>>> {
        self.active.by_drive(drive)
    }

    // ------------------------------------------------------------------------
    // リカバリ
    // ------------------------------------------------------------------------

    pub fn hold_all(&mut self) {
        self.active.hold_all();
    }

    pub fn release_hold(&mut self) {
        self.active.release_hold();
    }

    /// タイマー満了処理
    ///
    /// リカバリ中は何もしない。それ以外はまず前回の満了から隔離されている
    /// スロットを回収し、次に可視の各コマンドをタイムアウト済みにして
    /// スロットから外し、そのスロットを隔離する。
    /// 退避中のコマンドは対象外。
    pub fn expire(&mut self) -> Vec<Completion<T>> {
        if self.is_recovering() {
            return Vec::new();
        }
        self.reclaim_timed_out();

        let expired: Vec<Slot> = self
            .active
            .visible()
            .into_iter()
            .filter_map(|xfer| xfer.slot())
            .collect();
        expired
            .into_iter()
            .map(|slot| {
                let xfer = self.active.deactivate(slot);
                xfer.mark_timed_out();
                self.timed_out.insert(slot);
                Completion::new(xfer, XferStatus::Timeout)
            })
            .collect()
    }

    /// 隔離中のスロットをすべて空きに戻し、回収したスロットを返す
    ///
    /// 遅れた完了報告がもう届かないこと（ポートのリセット後など）を
    /// 呼び出し側が保証できるときに使う。
    pub fn reclaim_timed_out(&mut self) -> SlotMask {
        let reclaimed = self.timed_out;
        for slot in reclaimed.iter() {
            self.slots.free_slot(slot);
        }
        self.timed_out = SlotMask::EMPTY;
        reclaimed
    }

    /// 全コマンドを破棄して初期状態に戻す
    ///
    /// 凍結カウントは維持する。
    pub fn reset(&mut self, status: XferStatus) -> Vec<Completion<T>> {
        let drained = self.active.drain();
        self.slots.reset();
        self.timed_out = SlotMask::EMPTY;
        self.flags.remove(QueueFlags::RECOVERING);
        drained
            .into_iter()
            .map(|xfer| Completion::new(xfer, status))
            .collect()
    }

    /// 不変条件を検査する
    pub fn check_invariants(&self) -> bool {
        self.slot_state().is_partition(self.openings()) && self.active.is_consistent()
    }
}
