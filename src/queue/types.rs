//! キュー型定義
//!
//! 型安全なID、スロット番号、スロットビットマスクを定義

use core::fmt;

/// 1チャネルあたりの最大スロット数（ビットマスク幅）
pub const MAX_OPENINGS: u8 = 32;

// ============================================================================
// 型安全なID
// ============================================================================

/// チャネル番号
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelId(pub u8);

impl ChannelId {
    /// チャネル番号を取得
    pub fn as_u8(&self) -> u8 {
        self.0
    }
}

/// チャネル上のドライブ番号
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DriveId(pub u8);

impl DriveId {
    /// ドライブ番号を取得
    pub fn as_u8(&self) -> u8 {
        self.0
    }
}

/// ハードウェアスロット（タグ）番号（0-31）
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Slot(pub u8);

impl Slot {
    /// スロット番号を取得
    pub fn as_u8(&self) -> u8 {
        self.0
    }

    /// usizeに変換
    pub fn as_usize(&self) -> usize {
        self.0 as usize
    }

    /// 有効なスロット番号かチェック
    pub fn is_valid(&self) -> bool {
        self.0 < MAX_OPENINGS
    }

    /// このスロットだけを含むマスク（範囲外のスロットは空集合）
    pub fn mask(&self) -> SlotMask {
        if self.is_valid() {
            SlotMask(1u32 << self.0)
        } else {
            SlotMask::EMPTY
        }
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// スロットビットマスク
// ============================================================================

/// スロット集合（bit n = スロット n）
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SlotMask(u32);

impl SlotMask {
    /// 空集合
    pub const EMPTY: SlotMask = SlotMask(0);

    /// 生のビット値から作成
    pub const fn from_bits(bits: u32) -> Self {
        SlotMask(bits)
    }

    /// 下位 `n` スロット（0..n）を含むマスク
    pub const fn first(n: u8) -> Self {
        if n >= MAX_OPENINGS {
            SlotMask(u32::MAX)
        } else {
            SlotMask((1u32 << n) - 1)
        }
    }

    /// 生のビット値
    pub const fn bits(&self) -> u32 {
        self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn contains(&self, slot: Slot) -> bool {
        slot.is_valid() && self.0 & (1u32 << slot.0) != 0
    }

    pub fn insert(&mut self, slot: Slot) {
        self.0 |= slot.mask().0;
    }

    pub fn remove(&mut self, slot: Slot) {
        self.0 &= !slot.mask().0;
    }

    /// 要素数
    pub fn count(&self) -> u32 {
        self.0.count_ones()
    }

    /// 最小番号のスロット（find-first-set）
    pub fn lowest(&self) -> Option<Slot> {
        if self.0 == 0 {
            None
        } else {
            Some(Slot(self.0.trailing_zeros() as u8))
        }
    }

    pub fn intersection(self, other: SlotMask) -> SlotMask {
        SlotMask(self.0 & other.0)
    }

    pub fn union(self, other: SlotMask) -> SlotMask {
        SlotMask(self.0 | other.0)
    }

    /// 含まれるスロットを昇順に列挙
    pub fn iter(&self) -> SlotIter {
        SlotIter(self.0)
    }
}

impl fmt::Debug for SlotMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SlotMask({:#010x})", self.0)
    }
}

/// [`SlotMask::iter`] のイテレータ
pub struct SlotIter(u32);

impl Iterator for SlotIter {
    type Item = Slot;

    fn next(&mut self) -> Option<Slot> {
        if self.0 == 0 {
            return None;
        }
        let slot = self.0.trailing_zeros() as u8;
        self.0 &= self.0 - 1;
        Some(Slot(slot))
    }
}

/// スロット割り当て状態のスナップショット
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotState {
    /// 空きスロット
    pub avail: SlotMask,
    /// アクティブなコマンドが使用中のスロット
    pub used: SlotMask,
    /// リカバリ中に退避されたスロット
    pub hold: SlotMask,
    /// タイムアウトしたコマンドが残したスロット（遅れた完了報告か次の満了まで隔離）
    pub timed_out: SlotMask,
}

impl SlotState {
    /// 4つの集合が互いに素で、合わせて下位 `openings` ビットになるか
    pub fn is_partition(&self, openings: u8) -> bool {
        let sets = [self.avail, self.used, self.hold, self.timed_out];
        let mut seen = SlotMask::EMPTY;
        for set in sets {
            if !seen.intersection(set).is_empty() {
                return false;
            }
            seen = seen.union(set);
        }
        seen == SlotMask::first(openings)
    }
}
