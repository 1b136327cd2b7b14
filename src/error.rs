//! キューエラーと完了ステータス
//!
//! チャネルキューが呼び出し元に返すエラー型と、
//! 完了コールバックに渡されるステータスを定義します。
//!
//! プロトコル違反や二重完了はここには含まれません。
//! これらはスロット管理の不変条件違反であり、パニックとして扱います。

use core::fmt;

// ============================================================================
// QueueError
// ============================================================================

/// チャネルキューのエラー
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    /// 空きスロットがない（完了を待って再試行する）
    QueueFull,
    /// チャネルが凍結中で新規投入を受け付けない
    Frozen,
    /// プロトコル違反によりチャネルが停止している
    Halted,
    /// 無効なオープニング数
    InvalidOpenings(u8),
    /// 完了コールバックが設定されていない
    NoCompletionHandler,
}

impl QueueError {
    /// 呼び出し元が後で再試行すれば成功しうるエラーか
    pub fn is_retryable(&self) -> bool {
        matches!(self, QueueError::QueueFull | QueueError::Frozen)
    }
}

impl fmt::Display for QueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueError::QueueFull => write!(f, "no free command slot"),
            QueueError::Frozen => write!(f, "channel is frozen"),
            QueueError::Halted => write!(f, "channel halted after protocol violation"),
            QueueError::InvalidOpenings(n) => write!(f, "invalid openings: {}", n),
            QueueError::NoCompletionHandler => write!(f, "command has no completion handler"),
        }
    }
}

/// キュー操作の結果型
pub type QueueResult<T> = Result<T, QueueError>;

// ============================================================================
// XferStatus
// ============================================================================

/// 完了コールバックに渡されるステータス
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XferStatus {
    /// 正常完了
    Success,
    /// チャネルタイマーが満了した
    Timeout,
    /// ハードウェアがエラーを報告した（ATA エラーレジスタ値）
    HardwareError(u8),
    /// チャネルリセットまたはデタッチにより破棄された
    Reset,
}

impl XferStatus {
    /// 成功かどうか
    pub fn is_success(&self) -> bool {
        matches!(self, XferStatus::Success)
    }
}

impl fmt::Display for XferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            XferStatus::Success => write!(f, "success"),
            XferStatus::Timeout => write!(f, "timeout"),
            XferStatus::HardwareError(err) => write!(f, "hardware error {:#04x}", err),
            XferStatus::Reset => write!(f, "reset"),
        }
    }
}
