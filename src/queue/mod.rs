//! タグ付きコマンドキュー
//!
//! 1チャネル分の同時実行制御状態
//!
//! # モジュール構成
//!
//! - `types` - スロット番号、スロットビットマスク、ID型
//! - `slot` - 空きスロットのビットマスクアロケータ
//! - `xfer` - 転送コマンドと遅延完了
//! - `registry` - スロット索引のアクティブコマンドレジストリ
//! - `state` - 上記を束ねたキュー本体（ロックなし）

pub mod registry;
pub mod slot;
pub mod state;
pub mod types;
pub mod xfer;

pub use registry::ActiveXfers;
pub use slot::SlotAllocator;
pub use state::{QueueFlags, XferQueue};
pub use types::{ChannelId, DriveId, Slot, SlotIter, SlotMask, SlotState, MAX_OPENINGS};
pub use xfer::{Completion, Xfer, XferCallback, XferFlags};
