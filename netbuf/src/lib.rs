//! Byte buffer and wire parser used by every protocol crate in this
//! workspace.
//!
//! [`Buf`] is an append-only accumulator for bytes that are on their way
//! out to the wire; freed regions are zeroised so secrets do not linger in
//! reallocated memory. [`Parser`] is a read cursor over bytes that came in
//! from the wire, with a stack of marks so protocol readers can rewind to
//! the last fully-parsed position when they run out of data.

mod buf;
mod parser;

pub use buf::Buf;
pub use parser::Parser;

pub(crate) fn zeroize(bytes: &mut [u8]) {
    // Volatile stores so the wipe is not elided as a dead write.
    for b in bytes.iter_mut() {
        unsafe { std::ptr::write_volatile(b, 0) };
    }
}
