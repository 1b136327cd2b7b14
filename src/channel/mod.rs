// ============================================================================
// src/channel/mod.rs - ストレージチャネル
// ============================================================================
//!
//! # チャネル
//!
//! 1つのキュー、1つのロック、1つのタイムアウトタイマーを持つ直列化単位。
//! 外部のディスクドライバ、割り込みハンドラ、タイマー割り込みは
//! すべてここを経由してキューを操作する。
//!
//! ## ロック規約
//! - 公開操作はそれぞれ最小限の区間だけチャネルロックを取得する
//! - 完了コールバックは必ずロック解放後に呼ぶ
//!   （コールバック内から次のコマンドを投入できる）
//! - `hold_all` / `release_hold` はロック保持の証明である
//!   [`ChannelGuard`] にのみ存在する
//!
//! ## リカバリの流れ
//! ```ignore
//! let mut guard = channel.lock();
//! guard.set_recovering(true);
//! guard.hold_all();
//! let slot = guard.submit(&read_log_ext, 1)?;
//! // ... ポーリングでリカバリコマンドの完了を確認
//! let completion = guard.complete_slot(slot, XferStatus::Success);
//! guard.release_hold();
//! let completions = guard.reset(XferStatus::Reset);
//! drop(guard);
//! // ロック解放後に completion / completions を fire する
//! ```

pub mod config;
pub mod stats;
pub mod timeout;

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::error::{QueueError, QueueResult, XferStatus};
use crate::queue::{ChannelId, Completion, DriveId, Slot, SlotState, Xfer, XferQueue};
use crate::sync::{IrqMutex, IrqMutexGuard};

pub use config::{ChannelConfig, DEFAULT_TIMEOUT_TICKS};
pub use stats::{ChannelStats, ChannelStatsSnapshot};
pub use timeout::{ChannelTimer, ManualClock, TickSource, Ticks};

/// ロックで保護されるチャネル状態
struct ChannelInner<T> {
    queue: XferQueue<T>,
    timer: ChannelTimer,
}

// ============================================================================
// Channel
// ============================================================================

/// ストレージチャネル
pub struct Channel<T> {
    id: ChannelId,
    config: ChannelConfig,
    inner: IrqMutex<ChannelInner<T>>,
    clock: Box<dyn TickSource>,
    stats: ChannelStats,
}

impl<T> Channel<T> {
    /// チャネルをアタッチする
    ///
    /// `openings` はここで固定される。
    pub fn attach<C>(id: ChannelId, config: ChannelConfig, clock: C) -> QueueResult<Self>
    where
        C: TickSource + 'static,
    {
        config.validate()?;
        let queue = XferQueue::new(config.openings)?;
        log::debug!(
            "ch{}: attached, {} openings, timeout {} ticks",
            id.as_u8(),
            config.openings,
            config.timeout_ticks
        );

        Ok(Self {
            id,
            config,
            inner: IrqMutex::new(ChannelInner {
                queue,
                timer: ChannelTimer::new(config.timeout_ticks),
            }),
            clock: Box::new(clock),
            stats: ChannelStats::new(),
        })
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    pub fn openings(&self) -> u8 {
        self.config.openings
    }

    /// チャネルロックを取得する
    ///
    /// 返されるガードがロック保持の証明になる。
    pub fn lock(&self) -> ChannelGuard<'_, T> {
        ChannelGuard {
            inner: self.inner.lock(),
            channel: self,
        }
    }

    /// ロックを試行（割り込みコンテキストからのポーリング用）
    pub fn try_lock(&self) -> Option<ChannelGuard<'_, T>> {
        self.inner.try_lock().map(|inner| ChannelGuard {
            inner,
            channel: self,
        })
    }

    /// ガードがこのチャネルのものか
    pub fn owns(&self, guard: &ChannelGuard<'_, T>) -> bool {
        guard.inner.is_guard_of(&self.inner)
    }

    // ------------------------------------------------------------------------
    // 投入 / 完了
    // ------------------------------------------------------------------------

    /// コマンドを投入してスロットを得る
    ///
    /// 空きがなければ `QueueFull`（完了を待って再試行する）。
    pub fn submit(&self, xfer: &Arc<Xfer<T>>, drive_openings: u8) -> QueueResult<Slot> {
        self.lock().submit(xfer, drive_openings)
    }

    /// コマンドを完了させ、コールバックを呼ぶ
    ///
    /// コールバックが呼ばれた場合 `true`。
    pub fn complete(&self, xfer: &Arc<Xfer<T>>, status: XferStatus) -> bool {
        let completion = self.lock().complete(xfer, status);
        completion.is_some_and(Completion::fire)
    }

    /// ハードウェアがタグ `slot` の完了を報告した（NCQ）
    pub fn complete_slot(&self, slot: Slot, status: XferStatus) -> bool {
        let completion = self.lock().complete_slot(slot, status);
        completion.is_some_and(Completion::fire)
    }

    /// ハードウェアが唯一のアクティブコマンドの完了を報告した（非タグ付き）
    pub fn complete_single(&self, status: XferStatus) -> bool {
        let completion = {
            let mut guard = self.lock();
            let xfer = match guard.lookup_single_active() {
                Some(xfer) => Arc::clone(xfer),
                None => {
                    log::warn!("ch{}: spurious completion, no single active command", self.id.as_u8());
                    return false;
                }
            };
            guard.complete(&xfer, status)
        };
        completion.is_some_and(Completion::fire)
    }

    // ------------------------------------------------------------------------
    // 検索
    // ------------------------------------------------------------------------

    /// タグからコマンドを解決する
    ///
    /// タイムアウトしたコマンドが残した隔離スロットは `None`
    /// （完了通知は済んでいる。報告は [`Channel::complete_slot`] に渡せばよい）。
    ///
    /// # Panics
    /// スロットが使用中でも隔離中でもない場合（プロトコル違反、チャネルは停止する）。
    pub fn lookup_by_slot(&self, slot: Slot) -> Option<Arc<Xfer<T>>> {
        self.lock().lookup_by_slot(slot).cloned()
    }

    /// 非タグ付きチャネルの唯一のアクティブコマンド
    ///
    /// 可視のコマンドが複数ある場合、または NCQ コマンドの場合は `None`。
    pub fn lookup_single_active(&self) -> Option<Arc<Xfer<T>>> {
        self.lock().lookup_single_active().cloned()
    }

    /// 指定ドライブの最も古いアクティブコマンド
    pub fn lookup_drive_active(&self, drive: DriveId) -> Option<Arc<Xfer<T>>> {
        self.lock().lookup_drive_active(drive).cloned()
    }

    // ------------------------------------------------------------------------
    // 凍結
    // ------------------------------------------------------------------------

    pub fn freeze(&self) {
        self.lock().freeze();
    }

    pub fn thaw(&self) {
        self.lock().thaw();
    }

    pub fn is_frozen(&self) -> bool {
        self.lock().queue().is_frozen()
    }

    // ------------------------------------------------------------------------
    // タイムアウト / リセット
    // ------------------------------------------------------------------------

    /// タイマーのデッドラインを確認し、満了していれば処理する
    ///
    /// タイマー割り込みから周期的に呼ぶ。タイムアウト通知した数を返す。
    pub fn poll_timeout(&self) -> usize {
        let now = self.clock.now();
        let completions = {
            let mut guard = self.lock();
            if !guard.inner.timer.is_expired(now) {
                return 0;
            }
            guard.expire()
        };
        fire_all(completions)
    }

    /// 外部タイマーが満了した
    pub fn timer_expired(&self) -> usize {
        let completions = self.lock().expire();
        fire_all(completions)
    }

    /// 隔離中のスロットを即座に空きに戻す
    ///
    /// ポートをリセットした後など、遅れた完了報告がもう届かない場合に呼ぶ。
    /// 回収したスロット数を返す。
    pub fn reclaim_timed_out(&self) -> usize {
        self.lock().reclaim_timed_out()
    }

    /// 全コマンドを `status` で破棄し、キューを初期状態に戻す
    pub fn reset(&self, status: XferStatus) -> usize {
        let completions = self.lock().reset(status);
        fire_all(completions)
    }

    /// チャネルをデタッチする
    ///
    /// 残っているコマンドは `XferStatus::Reset` で完了通知する。
    pub fn detach(self) -> ChannelStatsSnapshot {
        self.drain_for_detach();
        log::debug!("ch{}: detached", self.id.as_u8());
        self.stats.snapshot()
    }

    fn drain_for_detach(&self) {
        let completions = {
            let mut guard = self.lock();
            if guard.is_idle() {
                return;
            }
            log::warn!(
                "ch{}: detaching with {} commands outstanding",
                self.id.as_u8(),
                guard.slot_state().used.union(guard.slot_state().hold).count()
            );
            guard.reset(XferStatus::Reset)
        };
        fire_all(completions);
    }

    // ------------------------------------------------------------------------
    // 状態参照
    // ------------------------------------------------------------------------

    pub fn stats(&self) -> ChannelStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn slot_state(&self) -> SlotState {
        self.lock().slot_state()
    }

    pub fn active_count(&self) -> usize {
        self.lock().active_count()
    }

    pub fn is_idle(&self) -> bool {
        self.lock().is_idle()
    }

    pub fn is_halted(&self) -> bool {
        self.lock().queue().is_halted()
    }

    /// タイマーのデッドライン（停止中は `None`）
    pub fn timer_deadline(&self) -> Option<Ticks> {
        self.lock().inner.timer.deadline()
    }
}

impl<T> Drop for Channel<T> {
    fn drop(&mut self) {
        self.drain_for_detach();
    }
}

fn fire_all<T>(completions: Vec<Completion<T>>) -> usize {
    completions
        .into_iter()
        .map(Completion::fire)
        .filter(|&fired| fired)
        .count()
}

// ============================================================================
// ChannelGuard
// ============================================================================

/// チャネルロックのガード
///
/// ロック保持中にしか許されない操作（`hold_all` / `release_hold`、
/// リカバリ中の投入と完了）を提供する。完了処理は [`Completion`] を返すだけで、
/// コールバックはガードを手放してから呼ぶこと。
pub struct ChannelGuard<'a, T> {
    inner: IrqMutexGuard<'a, ChannelInner<T>>,
    channel: &'a Channel<T>,
}

impl<T> ChannelGuard<'_, T> {
    /// キュー状態の参照
    pub fn queue(&self) -> &XferQueue<T> {
        &self.inner.queue
    }

    fn ch(&self) -> u8 {
        self.channel.id.as_u8()
    }

    /// 可視コマンドか隔離スロットがあれば現在時刻から再計時、なければ停止
    fn retime(&mut self) {
        if self.inner.queue.needs_timer() {
            let now = self.channel.clock.now();
            self.inner.timer.arm(now);
        } else {
            self.inner.timer.disarm();
        }
    }

    pub fn submit(&mut self, xfer: &Arc<Xfer<T>>, drive_openings: u8) -> QueueResult<Slot> {
        match self.inner.queue.submit(xfer, drive_openings) {
            Ok(slot) => {
                let now = self.channel.clock.now();
                self.inner.timer.arm_if_idle(now);
                ChannelStats::add(&self.channel.stats.submitted, 1);
                log::trace!(
                    "ch{}: drive {} -> slot {} ({:?})",
                    self.ch(),
                    xfer.drive().as_u8(),
                    slot,
                    xfer.flags()
                );
                Ok(slot)
            }
            Err(QueueError::QueueFull) => {
                ChannelStats::add(&self.channel.stats.queue_full, 1);
                log::trace!("ch{}: queue full (drive openings {})", self.ch(), drive_openings);
                Err(QueueError::QueueFull)
            }
            Err(err) => {
                log::debug!("ch{}: submit refused: {}", self.ch(), err);
                Err(err)
            }
        }
    }

    pub fn complete_slot(&mut self, slot: Slot, status: XferStatus) -> Option<Completion<T>> {
        let completion = self.inner.queue.complete_slot(slot, status);
        self.account_completion(Some(slot), completion.is_some());
        completion
    }

    pub fn complete(&mut self, xfer: &Arc<Xfer<T>>, status: XferStatus) -> Option<Completion<T>> {
        let slot = xfer.slot();
        let completion = self.inner.queue.complete(xfer, status);
        self.account_completion(slot, completion.is_some());
        completion
    }

    fn account_completion(&mut self, slot: Option<Slot>, notify: bool) {
        if notify {
            ChannelStats::add(&self.channel.stats.completed, 1);
            log::trace!("ch{}: slot {:?} completed", self.ch(), slot);
        } else {
            ChannelStats::add(&self.channel.stats.stray_completions, 1);
            log::warn!("ch{}: late completion for timed-out command (slot {:?})", self.ch(), slot);
        }
        self.retime();
    }

    pub fn lookup_by_slot(&mut self, slot: Slot) -> Option<&Arc<Xfer<T>>> {
        self.inner.queue.lookup_by_slot(slot)
    }

    pub fn lookup_single_active(&self) -> Option<&Arc<Xfer<T>>> {
        self.inner.queue.lookup_single_active()
    }

    pub fn lookup_drive_active(&self, drive: DriveId) -> Option<&Arc<Xfer<T>>> {
        self.inner.queue.lookup_drive_active(drive)
    }

    /// アクティブな全スロットを退避する
    pub fn hold_all(&mut self) {
        self.inner.queue.hold_all();
        log::debug!("ch{}: holding slots {:?}", self.ch(), self.inner.queue.slot_state().hold);
        self.retime();
    }

    /// 退避したスロットを戻す
    pub fn release_hold(&mut self) {
        log::debug!("ch{}: releasing slots {:?}", self.ch(), self.inner.queue.slot_state().hold);
        self.inner.queue.release_hold();
        self.retime();
    }

    pub fn set_recovering(&mut self, recovering: bool) {
        log::debug!("ch{}: recovering = {}", self.ch(), recovering);
        self.inner.queue.set_recovering(recovering);
    }

    pub fn is_recovering(&self) -> bool {
        self.inner.queue.is_recovering()
    }

    pub fn freeze(&mut self) {
        self.inner.queue.freeze();
        log::debug!("ch{}: freeze ({})", self.ch(), self.inner.queue.freeze_count());
    }

    pub fn thaw(&mut self) {
        self.inner.queue.thaw();
        log::debug!("ch{}: thaw ({})", self.ch(), self.inner.queue.freeze_count());
    }

    /// タイマー満了処理
    pub fn expire(&mut self) -> Vec<Completion<T>> {
        let quarantined = self.inner.queue.slot_state().timed_out;
        let completions = self.inner.queue.expire();
        if self.inner.queue.is_recovering() {
            log::debug!("ch{}: timer expired during recovery, ignored", self.ch());
        } else {
            if !quarantined.is_empty() {
                ChannelStats::add(&self.channel.stats.reclaimed, quarantined.count() as u64);
                log::debug!("ch{}: reclaimed timed-out slots {:?}", self.ch(), quarantined);
            }
            if !completions.is_empty() {
                ChannelStats::add(&self.channel.stats.timeouts, completions.len() as u64);
                log::warn!("ch{}: timeout, {} commands", self.ch(), completions.len());
            }
        }
        self.retime();
        completions
    }

    /// 隔離中のスロットを空きに戻す
    pub fn reclaim_timed_out(&mut self) -> usize {
        let reclaimed = self.inner.queue.reclaim_timed_out();
        if !reclaimed.is_empty() {
            ChannelStats::add(&self.channel.stats.reclaimed, reclaimed.count() as u64);
            log::debug!("ch{}: reclaimed timed-out slots {:?}", self.ch(), reclaimed);
        }
        self.retime();
        reclaimed.count() as usize
    }

    /// 全コマンドを破棄してキューを初期状態に戻す
    pub fn reset(&mut self, status: XferStatus) -> Vec<Completion<T>> {
        let completions = self.inner.queue.reset(status);
        self.inner.timer.disarm();
        ChannelStats::add(&self.channel.stats.resets, 1);
        log::debug!("ch{}: reset, {} commands dropped ({})", self.ch(), completions.len(), status);
        completions
    }

    pub fn slot_state(&self) -> SlotState {
        self.inner.queue.slot_state()
    }

    pub fn active_count(&self) -> usize {
        self.inner.queue.active_count()
    }

    pub fn is_idle(&self) -> bool {
        self.inner.queue.is_idle()
    }
}
