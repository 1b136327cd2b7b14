//! チャネル設定

use crate::error::{QueueError, QueueResult};
use crate::queue::MAX_OPENINGS;

use super::timeout::Ticks;

/// デフォルトのコマンドタイムアウト（tick、1kHz で 10 秒）
pub const DEFAULT_TIMEOUT_TICKS: Ticks = 10_000;

/// チャネル設定
///
/// `openings` はアタッチ時に固定され、以後変更されない。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelConfig {
    /// ハードウェアスロット数（1..=32）
    pub openings: u8,
    /// チャネルタイマーのタイムアウト（tick）
    pub timeout_ticks: Ticks,
}

impl ChannelConfig {
    pub const fn new(openings: u8) -> Self {
        Self {
            openings,
            timeout_ticks: DEFAULT_TIMEOUT_TICKS,
        }
    }

    pub const fn with_timeout(mut self, ticks: Ticks) -> Self {
        self.timeout_ticks = ticks;
        self
    }

    /// 設定値を検証
    pub fn validate(&self) -> QueueResult<()> {
        if self.openings == 0 || self.openings > MAX_OPENINGS {
            return Err(QueueError::InvalidOpenings(self.openings));
        }
        Ok(())
    }
}

impl Default for ChannelConfig {
    /// 非タグ付き（1スロット）チャネル
    fn default() -> Self {
        Self::new(1)
    }
}
