// ============================================================================
// src/sync/irq_mutex.rs - 割り込み禁止Mutex
//
// 問題: チャネルの完了処理は割り込みハンドラから呼ばれる
// → ドライバスレッドがロック中に割り込みが入ると同じロックでデッドロック
//
// 解決: ベアメタル x86_64 ではロック取得時に割り込みを禁止し、
//       ガード解放時に元の状態へ復元する
//       ホスト (テスト) 環境では単純なスピンロックとして振る舞う
// ============================================================================

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

/// 割り込みフラグを保存して割り込みを禁止
///
/// 元の割り込み有効状態を返す。
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
#[inline]
fn save_and_disable_interrupts() -> bool {
    use x86_64::instructions::interrupts;

    let was_enabled = interrupts::are_enabled();
    interrupts::disable();
    was_enabled
}

#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
#[inline]
fn save_and_disable_interrupts() -> bool {
    false
}

/// 割り込みを復元（元々有効だった場合のみ有効化）
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
#[inline]
fn restore_interrupts(was_enabled: bool) {
    if was_enabled {
        x86_64::instructions::interrupts::enable();
    }
}

#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
#[inline]
fn restore_interrupts(_was_enabled: bool) {}

/// 割り込み禁止Mutex
///
/// ロック取得時に割り込みを禁止し、ガードのドロップ時に復元する。
/// ガード型 [`IrqMutexGuard`] は「ロックを保持している」ことの証明として
/// 上位層の API 引数に使われる。
///
/// # Usage
/// ```ignore
/// let queue = IrqMutex::new(0u32);
/// {
///     let mut guard = queue.lock();
///     *guard += 1;
/// } // ここで解放、割り込み状態を復元
/// ```
pub struct IrqMutex<T: ?Sized> {
    locked: AtomicBool,
    data: UnsafeCell<T>,
}

// SAFETY: IrqMutex は locked フラグで排他的アクセスを保証する
unsafe impl<T: ?Sized + Send> Sync for IrqMutex<T> {}
unsafe impl<T: ?Sized + Send> Send for IrqMutex<T> {}

impl<T> IrqMutex<T> {
    /// 新しい IrqMutex を作成
    pub const fn new(data: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            data: UnsafeCell::new(data),
        }
    }

    /// 中身を取り出す
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized> IrqMutex<T> {
    /// ロックを取得
    ///
    /// 割り込みを禁止してからスピンする。
    pub fn lock(&self) -> IrqMutexGuard<'_, T> {
        let irq_was_enabled = save_and_disable_interrupts();

        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            while self.locked.load(Ordering::Relaxed) {
                core::hint::spin_loop();
            }
        }

        IrqMutexGuard {
            lock: self,
            irq_was_enabled,
        }
    }

    /// ロックを試行（失敗したら即座に返る）
    pub fn try_lock(&self) -> Option<IrqMutexGuard<'_, T>> {
        let irq_was_enabled = save_and_disable_interrupts();

        if self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            Some(IrqMutexGuard {
                lock: self,
                irq_was_enabled,
            })
        } else {
            restore_interrupts(irq_was_enabled);
            None
        }
    }

    /// ロック状態を確認（デバッグ用）
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }

    /// 排他参照からロックなしでアクセス
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }
}

/// IrqMutex のガード
///
/// ドロップ時にロックを解放し、その後で割り込み状態を復元する。
pub struct IrqMutexGuard<'a, T: ?Sized> {
    lock: &'a IrqMutex<T>,
    irq_was_enabled: bool,
}

impl<T: ?Sized> IrqMutexGuard<'_, T> {
    /// このガードが `mutex` のものか
    pub fn is_guard_of(&self, mutex: &IrqMutex<T>) -> bool {
        core::ptr::eq(self.lock, mutex)
    }
}

impl<T: ?Sized> Deref for IrqMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: ロックを保持しているので安全にアクセス可能
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for IrqMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: ロックを保持しているので安全にアクセス可能
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for IrqMutexGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
        restore_interrupts(self.irq_was_enabled);
    }
}
