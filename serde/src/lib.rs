//! # Undine Serde
//! Bit-level serialization primitives shared by the undine scene
//! synchronization protocol.
//!
//! The wire format is bit-addressed: values start at arbitrary bit offsets,
//! bits pack LSB-first within each byte, and multi-byte values are
//! little-endian. [`BitWriter`] and [`BitReader`] carry the raw primitives
//! (bits, bytes, variable-length integers, strings) plus the quantized
//! spatial encodings the rigid-body channel depends on (fixed point,
//! quantized floats with inspectable patterns, spherical unit vectors,
//! magnitude-plus-direction vectors, arithmetic-coded tuples).
//!
//! This crate knows nothing about entities, components, or scenes.

mod bit_reader;
mod bit_writer;
mod error;
mod serde;

pub use bit_reader::BitReader;
pub use bit_writer::{BitWrite, BitWriter};
pub use error::{SerdeErr, SerdeResult};
pub use serde::Serde;
