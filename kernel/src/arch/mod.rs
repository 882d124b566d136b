//! Architecture support
//!
//! The display path only needs ordering primitives from the architecture
//! layer; everything else runs on portable code.

pub mod barriers;
