//! Shared foundational types used across the Prism GPU shader compiler.
//!
//! This crate provides core types that every stage of the pipeline compiler
//! depends on, starting with the 128-bit content fingerprint used to key
//! compiled artifacts.

#![warn(missing_docs)]

pub mod key;

pub use key::CacheKey;
