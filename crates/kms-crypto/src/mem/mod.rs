//! Secure memory handling
//!
//! The Master Secret is the one value in this system that must be wiped on
//! every exit path from the with-unlock scope — success, failure, or
//! cancellation. [`SecureBuf`] is the wrapper that makes that automatic.

pub mod secure_buf;

pub use secure_buf::SecureBuf;
