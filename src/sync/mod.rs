// ============================================================================
// src/sync/mod.rs - 同期プリミティブ
// 割り込みコンテキストからも取得できるチャネルロック
// ============================================================================

pub mod irq_mutex;

pub use irq_mutex::{IrqMutex, IrqMutexGuard};
