//! Runtime-library redirection targets
//!
//! Private implementations of the `Rtl*` routines the redirection table
//! points privately-loaded libraries at: process-heap allocation backed by
//! the host heap, and the counted-string free routines.

pub mod heap;
pub mod string;
