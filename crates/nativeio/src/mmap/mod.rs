//! Reference-counted memory mappings.
//!
//! A [MappedRegion] maps one file. A [MappedGuard] owns the region and counts
//! references to it. [MappedInput] views read through the guard: the root view
//! holds a reference, and the slices and clones derived from it share the
//! mapping until the root closes.

mod guard;
mod input;
mod region;

pub use guard::MappedGuard;
pub use input::MappedInput;
pub use region::MappedRegion;
