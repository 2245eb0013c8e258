//! The only place the crate touches the CPU directly.
//!
//! Two backends expose the same surface: `x86` issues the real privileged
//! instructions on a 32-bit protected-mode CPU, `hosted` stands in on every
//! other target so the rest of the kernel stays portable enough to unit test.
//! The hosted backend records its effects when built for tests.

#[cfg(all(target_arch = "x86", not(test)))]
mod x86;
#[cfg(all(target_arch = "x86", not(test)))]
pub use x86::*;

#[cfg(any(not(target_arch = "x86"), test))]
mod hosted;
#[cfg(any(not(target_arch = "x86"), test))]
pub use hosted::*;
