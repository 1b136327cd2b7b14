//! チャネルタイマー
//!
//! コマンドごとではなくチャネルに1つのデッドライン型タイマー。
//! コマンドがアクティブな間だけ張られ、満了すると可視の全コマンドを
//! タイムアウトとして扱う。時刻は [`TickSource`] から取得する。

use alloc::sync::Arc;
use core::sync::atomic::{AtomicU64, Ordering};

/// タイムスタンプ（起動からの tick 数）
pub type Ticks = u64;

/// 時刻ソース
///
/// カーネルではタイマー割り込みで進むカウンタ、テストでは [`ManualClock`]。
pub trait TickSource: Send + Sync {
    /// 現在時刻
    fn now(&self) -> Ticks;
}

impl<C: TickSource + ?Sized> TickSource for Arc<C> {
    fn now(&self) -> Ticks {
        (**self).now()
    }
}

/// 手動で進める時計
///
/// タイマー割り込みハンドラから [`ManualClock::advance`] を呼んで使う。
#[derive(Debug, Default)]
pub struct ManualClock {
    ticks: AtomicU64,
}

impl ManualClock {
    pub const fn new(start: Ticks) -> Self {
        Self {
            ticks: AtomicU64::new(start),
        }
    }

    /// `delta` tick 進めて新しい時刻を返す
    pub fn advance(&self, delta: Ticks) -> Ticks {
        self.ticks.fetch_add(delta, Ordering::AcqRel) + delta
    }

    pub fn set(&self, now: Ticks) {
        self.ticks.store(now, Ordering::Release);
    }
}

impl TickSource for ManualClock {
    fn now(&self) -> Ticks {
        self.ticks.load(Ordering::Acquire)
    }
}

/// チャネルタイマー
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelTimer {
    timeout: Ticks,
    deadline: Option<Ticks>,
}

impl ChannelTimer {
    pub const fn new(timeout: Ticks) -> Self {
        Self {
            timeout,
            deadline: None,
        }
    }

    pub fn timeout(&self) -> Ticks {
        self.timeout
    }

    pub fn deadline(&self) -> Option<Ticks> {
        self.deadline
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    /// `now` から再計時
    pub fn arm(&mut self, now: Ticks) {
        self.deadline = Some(now.saturating_add(self.timeout));
    }

    /// 停止中なら `now` から計時（既に張られていればそのまま）
    pub fn arm_if_idle(&mut self, now: Ticks) {
        if self.deadline.is_none() {
            self.arm(now);
        }
    }

    pub fn disarm(&mut self) {
        self.deadline = None;
    }

    /// 満了しているか
    pub fn is_expired(&self, now: Ticks) -> bool {
        self.deadline.is_some_and(|deadline| now >= deadline)
    }
}
