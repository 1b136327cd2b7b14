//! 転送コマンド (Xfer)
//!
//! 上位のディスクドライバが作成・所有する1つのストレージコマンド。
//! キューはアクティブな間だけ `Arc` で参照を保持し、
//! 完了コールバックを高々1回だけ呼び出す。

use alloc::boxed::Box;
use alloc::sync::Arc;
use core::fmt;
use core::sync::atomic::{AtomicU8, AtomicU32, Ordering};

use bitflags::bitflags;
use spin::Mutex;

use crate::error::XferStatus;

use super::types::{DriveId, Slot};

/// スロット未割り当てを表す値
const NO_SLOT: u8 = u8::MAX;

bitflags! {
    /// コマンドフラグ
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct XferFlags: u32 {
        /// NCQ タグ付きコマンド（スロット番号で完了が報告される）
        const NCQ = 1 << 0;
        /// エラーリカバリ用コマンド
        const RECOVERY = 1 << 1;
        /// チャネルタイマー満了でタイムアウト扱いになった
        const TIMED_OUT = 1 << 2;
    }
}

/// 完了コールバック
pub type XferCallback<T> = Box<dyn FnOnce(&Xfer<T>, XferStatus) + Send>;

/// 転送コマンド
///
/// `context` にはドライバ固有のコマンド情報（LBA、バッファ等）を保持する。
pub struct Xfer<T> {
    drive: DriveId,
    slot: AtomicU8,
    flags: AtomicU32,
    callback: Mutex<Option<XferCallback<T>>>,
    context: T,
}

impl<T> Xfer<T> {
    /// 完了コールバック付きで作成
    pub fn new<F>(drive: DriveId, flags: XferFlags, context: T, callback: F) -> Self
    where
        F: FnOnce(&Xfer<T>, XferStatus) + Send + 'static,
    {
        let xfer = Self::unarmed(drive, flags, context);
        *xfer.callback.lock() = Some(Box::new(callback));
        xfer
    }

    /// コールバックなしで作成（投入前に [`Xfer::set_callback`] が必要）
    pub fn unarmed(drive: DriveId, flags: XferFlags, context: T) -> Self {
        Self {
            drive,
            slot: AtomicU8::new(NO_SLOT),
            flags: AtomicU32::new(flags.difference(XferFlags::TIMED_OUT).bits()),
            callback: Mutex::new(None),
            context,
        }
    }

    /// 完了コールバックを設定（再利用時の再装填）
    pub fn set_callback<F>(&self, callback: F)
    where
        F: FnOnce(&Xfer<T>, XferStatus) + Send + 'static,
    {
        *self.callback.lock() = Some(Box::new(callback));
    }

    /// コールバックが装填されているか
    pub fn has_callback(&self) -> bool {
        self.callback.lock().is_some()
    }

    pub fn drive(&self) -> DriveId {
        self.drive
    }

    /// 割り当て中のスロット（アクティブな間のみ）
    pub fn slot(&self) -> Option<Slot> {
        match self.slot.load(Ordering::Acquire) {
            NO_SLOT => None,
            n => Some(Slot(n)),
        }
    }

    pub fn flags(&self) -> XferFlags {
        XferFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    pub fn is_ncq(&self) -> bool {
        self.flags().contains(XferFlags::NCQ)
    }

    pub fn is_recovery(&self) -> bool {
        self.flags().contains(XferFlags::RECOVERY)
    }

    pub fn is_timed_out(&self) -> bool {
        self.flags().contains(XferFlags::TIMED_OUT)
    }

    /// ドライバ固有のコンテキスト
    pub fn context(&self) -> &T {
        &self.context
    }

    pub(crate) fn bind_slot(&self, slot: Slot) {
        self.slot.store(slot.as_u8(), Ordering::Release);
    }

    pub(crate) fn unbind_slot(&self) {
        self.slot.store(NO_SLOT, Ordering::Release);
    }

    /// タイムアウト済みにする。新たにマークした場合 `true`
    pub(crate) fn mark_timed_out(&self) -> bool {
        let prev = self
            .flags
            .fetch_or(XferFlags::TIMED_OUT.bits(), Ordering::AcqRel);
        prev & XferFlags::TIMED_OUT.bits() == 0
    }

    pub(crate) fn clear_timed_out(&self) {
        self.flags
            .fetch_and(!XferFlags::TIMED_OUT.bits(), Ordering::AcqRel);
    }

    fn take_callback(&self) -> Option<XferCallback<T>> {
        self.callback.lock().take()
    }
}

impl<T> fmt::Debug for Xfer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Xfer")
            .field("drive", &self.drive)
            .field("slot", &self.slot())
            .field("flags", &self.flags())
            .finish()
    }
}

// ============================================================================
// 遅延完了
// ============================================================================

/// チャネルロックの外で実行される完了通知
///
/// キューはロック中に `Completion` を作るだけで、コールバックは呼ばない。
/// 呼び出し側はロック（[`crate::ChannelGuard`]）を解放してから
/// [`Completion::fire`] を呼ぶこと。
#[must_use = "completion callbacks only run when the completion is fired"]
pub struct Completion<T> {
    xfer: Arc<Xfer<T>>,
    status: XferStatus,
}

impl<T> Completion<T> {
    pub(crate) fn new(xfer: Arc<Xfer<T>>, status: XferStatus) -> Self {
        Self { xfer, status }
    }

    pub fn xfer(&self) -> &Arc<Xfer<T>> {
        &self.xfer
    }

    pub fn status(&self) -> XferStatus {
        self.status
    }

    /// コールバックを呼び出す。既に呼ばれていた場合は何もせず `false`
    pub fn fire(self) -> bool {
        match self.xfer.take_callback() {
            Some(callback) => {
                callback(&self.xfer, self.status);
                true
            }
            None => false,
        }
    }
}

impl<T> fmt::Debug for Completion<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("xfer", &self.xfer)
            .field("status", &self.status)
            .finish()
    }
}
