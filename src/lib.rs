// ============================================================================
// src/lib.rs - ATA チャネル用タグ付きコマンドキュー
// ============================================================================
//!
//! # ata_xferq
//!
//! ストレージコントローラのチャネルドライバが、少数のハードウェア
//! 実行スロット上で複数の転送コマンド (NCQ タグ付きコマンドを含む) を
//! 多重化するためのキューコア。
//!
//! ## 構成
//! - [`queue`] - スロットビットマスクアロケータ、アクティブコマンドレジストリ
//! - [`channel`] - チャネルロック、タイムアウトタイマー、公開API
//! - [`sync`] - 割り込み安全なスピンロック
//! - [`error`] - エラー型と完了ステータス
//!
//! ## 使用方法
//! ```ignore
//! let channel = Channel::attach(ChannelId(0), ChannelConfig::new(32), clock)?;
//! let xfer = Arc::new(Xfer::new(DriveId(0), XferFlags::NCQ, ctx, |xfer, status| {
//!     // 完了処理（チャネルロックは保持されていない）
//! }));
//! let slot = channel.submit(&xfer, 32)?;
//! // ... 割り込みハンドラから
//! channel.complete_slot(slot, XferStatus::Success);
//! ```

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod channel;
pub mod error;
pub mod queue;
pub mod sync;

pub use channel::{
    Channel, ChannelConfig, ChannelGuard, ChannelStats, ChannelStatsSnapshot, ManualClock,
    TickSource, Ticks, DEFAULT_TIMEOUT_TICKS,
};
pub use error::{QueueError, QueueResult, XferStatus};
pub use queue::{
    ChannelId, Completion, DriveId, Slot, SlotMask, SlotState, Xfer, XferFlags, XferQueue,
    MAX_OPENINGS,
};
