//! チャネル統計

use core::sync::atomic::{AtomicU64, Ordering};

/// チャネル統計カウンタ
#[derive(Debug, Default)]
pub struct ChannelStats {
    pub submitted: AtomicU64,
    pub completed: AtomicU64,
    pub queue_full: AtomicU64,
    pub timeouts: AtomicU64,
    pub stray_completions: AtomicU64,
    /// 次の満了または明示的な回収で空きに戻した隔離スロット数
    pub reclaimed: AtomicU64,
    pub resets: AtomicU64,
}

/// 統計のスナップショット
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelStatsSnapshot {
    pub submitted: u64,
    pub completed: u64,
    pub queue_full: u64,
    pub timeouts: u64,
    pub stray_completions: u64,
    pub reclaimed: u64,
    pub resets: u64,
}

impl ChannelStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ChannelStatsSnapshot {
        ChannelStatsSnapshot {
            submitted: self.submitted.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            queue_full: self.queue_full.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            stray_completions: self.stray_completions.load(Ordering::Relaxed),
            reclaimed: self.reclaimed.load(Ordering::Relaxed),
            resets: self.resets.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot() {
        let stats = ChannelStats::new();
        ChannelStats::add(&stats.submitted, 3);
        ChannelStats::add(&stats.timeouts, 1);
        let snap = stats.snapshot();
        assert_eq!(snap.submitted, 3);
        assert_eq!(snap.timeouts, 1);
        assert_eq!(snap.completed, 0);
    }
}
