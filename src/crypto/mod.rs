//! Cryptographic utilities for the overlay

pub mod hash;

pub use hash::sha256_array;
