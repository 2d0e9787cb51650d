//! # Memory System Calls
//!
//! The user-visible face of the kernel heap: `malloc`, `realloc`, `free` and
//! an allocator statistics query. Arguments arrive in registers following the
//! kernel's `int 0x80` convention; the number in `rax`, arguments in `rdi`
//! and `rsi`, the result written back to `rax`.

#![cfg_attr(not(any(test, doctest)), no_std)]

pub mod syscall;

pub use syscall::{Sysno, SyscallFrame, dispatch};
