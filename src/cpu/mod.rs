//! CPU architecture support.
//!
//! Only x86_64 guests are supported; the boot protocol puts the virtual CPU
//! directly into 64-bit long mode.

pub mod x86_64;
