//! Interrupt masking.
//!
//! On the bare-metal x86-64 kernel target the interrupt flag is read with
//! `pushfq/pop` and toggled with `cli`/`sti`. Hosted builds (unit tests, tools)
//! cannot execute those instructions, so there the interrupt state is reported
//! as "disabled" and masking becomes a no-op; the spinlock still provides
//! mutual exclusion between threads.

use crate::{SpinLock, SpinLockGuard};
use core::ops::{Deref, DerefMut};

/// Bit 9 of `RFLAGS`.
const RFLAGS_IF: u64 = 1 << 9;

/// Disables hardware interrupts (`cli`).
///
/// # Safety & Privilege
///
/// Must only be called in contexts where `cli` is permitted.
#[inline]
pub fn cli_stop_interrupts() {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    unsafe {
        core::arch::asm!("cli", options(nomem, nostack, preserves_flags));
    }
}

/// Enables hardware interrupts (`sti`).
///
/// # Safety & Privilege
///
/// Must only be called in contexts where `sti` is permitted. Typically used
/// to restore a previously disabled interrupt state.
#[inline]
pub fn sti_enable_interrupts() {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    unsafe {
        core::arch::asm!("sti", options(nomem, nostack, preserves_flags));
    }
}

/// Returns the current `RFLAGS` value (via `pushfq/pop`).
///
/// Hosted builds return `0`, i.e. "interrupts disabled".
#[inline]
#[must_use]
pub fn rflags() -> u64 {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    {
        let r: u64;
        unsafe {
            core::arch::asm!("pushfq; pop {}", out(reg) r, options(nomem, preserves_flags));
        }
        r
    }
    #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
    {
        0
    }
}

/// Whether maskable interrupts are currently enabled.
#[inline]
#[must_use]
pub fn interrupts_enabled() -> bool {
    rflags() & RFLAGS_IF != 0
}

/// RAII guard that disables interrupts on creation and restores them on drop.
///
/// `IrqGuard::new()` snapshots the `IF` bit. If interrupts were enabled, it
/// executes `cli`. On drop, it executes `sti` **only** if they were previously
/// enabled, so nested guards restore the outermost state correctly.
///
/// ```no_run
/// use kernel_sync::irq::{IrqGuard, interrupts_enabled};
///
/// let before = interrupts_enabled();
/// {
///     let _g = IrqGuard::new();
///     assert!(!interrupts_enabled());
/// }
/// assert_eq!(interrupts_enabled(), before);
/// ```
pub struct IrqGuard {
    /// Whether interrupts were enabled (IF=1) when the guard was created.
    were_enabled: bool,
}

impl Default for IrqGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl IrqGuard {
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        let enabled = interrupts_enabled();
        if enabled {
            cli_stop_interrupts();
        }
        Self {
            were_enabled: enabled,
        }
    }

    /// Whether this guard will re-enable interrupts when dropped.
    #[inline]
    #[must_use]
    pub const fn restores(&self) -> bool {
        self.were_enabled
    }
}

impl Drop for IrqGuard {
    fn drop(&mut self) {
        if self.were_enabled {
            sti_enable_interrupts();
        }
    }
}

/// A spinlock guard that also keeps interrupts masked while held.
///
/// Field order matters: the lock guard is declared first so it is dropped
/// (unlocked) before the interrupt state is restored.
pub struct IrqSpinLockGuard<'a, T> {
    guard: SpinLockGuard<'a, T>,
    _irq: IrqGuard,
}

impl<T> SpinLock<T> {
    /// Masks interrupts, then spins until the lock is acquired.
    ///
    /// Dropping the returned guard releases the lock first and restores the
    /// previous interrupt state second.
    #[inline]
    pub fn lock_irq(&self) -> IrqSpinLockGuard<'_, T> {
        let irq = IrqGuard::new();
        let guard = self.lock();
        IrqSpinLockGuard { guard, _irq: irq }
    }

    /// Closure convenience around [`lock_irq`](Self::lock_irq).
    #[inline]
    pub fn with_lock_irq<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let mut g = self.lock_irq();
        f(&mut g)
    }
}

impl<T> Deref for IrqSpinLockGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for IrqSpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}
