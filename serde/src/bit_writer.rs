use std::f32::consts::PI;

/// Destination for bit-level writes.
///
/// Bits are packed LSB-first within each byte and multi-byte values are
/// little-endian, so a reader consuming the produced buffer byte-by-byte
/// sees the same layout regardless of how writes straddled byte boundaries.
/// Nothing here ever aligns; callers own the bit budget.
pub trait BitWrite {
    /// Writes a single bit.
    fn write_bit(&mut self, bit: bool);

    /// Writes a full byte, unaligned.
    fn write_byte(&mut self, byte: u8) {
        for i in 0..8 {
            self.write_bit((byte >> i) & 1 != 0);
        }
    }

    /// Writes the low `bits` bits of `value`, LSB first. `bits` must be <= 32.
    fn write_bits(&mut self, value: u32, bits: u32) {
        debug_assert!(bits <= 32, "write_bits supports at most 32 bits");
        for i in 0..bits {
            self.write_bit((value >> i) & 1 != 0);
        }
    }

    /// Writes a byte slice without aligning first.
    fn write_bytes(&mut self, bytes: &[u8]) {
        for byte in bytes {
            self.write_byte(*byte);
        }
    }

    /// Variable-length unsigned integer: 1, 2, or 4 bytes holding 7, 14, or
    /// 30 bits of payload, selected by a continuation bit after each of the
    /// first two 7-bit groups.
    ///
    /// # Panics
    ///
    /// Panics if `value` does not fit in 30 bits.
    fn write_vle_u32(&mut self, value: u32) {
        if value < 1 << 7 {
            self.write_bits(value, 7);
            self.write_bit(false);
        } else if value < 1 << 14 {
            self.write_bits(value & 0x7f, 7);
            self.write_bit(true);
            self.write_bits(value >> 7, 7);
            self.write_bit(false);
        } else if value < 1 << 30 {
            self.write_bits(value & 0x7f, 7);
            self.write_bit(true);
            self.write_bits((value >> 7) & 0x7f, 7);
            self.write_bit(true);
            self.write_bits(value >> 14, 16);
        } else {
            panic!("value {value} does not fit in a 30-bit VLE field");
        }
    }

    /// Length-prefixed UTF-8 string: VLE byte count, then the raw bytes.
    fn write_string(&mut self, value: &str) {
        self.write_vle_u32(value.len() as u32);
        self.write_bytes(value.as_bytes());
    }

    /// Unsigned fixed point with `int_bits + frac_bits` total bits.
    /// Out-of-range values saturate.
    fn write_fixed_point(&mut self, int_bits: u32, frac_bits: u32, value: f32) {
        let total = int_bits + frac_bits;
        debug_assert!(total <= 32);
        let max = ((1u64 << total) - 1) as f32;
        let scaled = (value * (1u32 << frac_bits) as f32 + 0.5).clamp(0.0, max);
        self.write_bits(scaled as u32, total);
    }

    /// Signed fixed point: biases by `2^(int_bits - 1)` so the encoded range
    /// is `[-2^(int_bits-1), 2^(int_bits-1))`.
    fn write_signed_fixed_point(&mut self, int_bits: u32, frac_bits: u32, value: f32) {
        self.write_fixed_point(int_bits, frac_bits, value + (1u32 << (int_bits - 1)) as f32);
    }

    /// Quantizes `value` from `[min, max]` onto `bits` bits and returns the
    /// raw quantized pattern, so callers can test sentinels (e.g. a zero
    /// rotation angle) without reconstructing the float.
    fn write_quantized_float(&mut self, min: f32, max: f32, bits: u32, value: f32) -> u32 {
        let scale = ((1u64 << bits) - 1) as f32;
        let quantized = ((value - min) * scale / (max - min) + 0.5).clamp(0.0, scale) as u32;
        self.write_bits(quantized, bits);
        quantized
    }

    /// Unit 2D vector as a quantized plane angle over `bits` bits.
    fn write_normalized_vec2(&mut self, x: f32, y: f32, bits: u32) {
        self.write_quantized_float(-PI, PI, bits, y.atan2(x));
    }

    /// Unit 3D vector in spherical form: azimuth `atan2(x, z)` on
    /// `yaw_bits`, inclination `asin(-y)` on `pitch_bits`.
    fn write_normalized_vec3(&mut self, x: f32, y: f32, z: f32, yaw_bits: u32, pitch_bits: u32) {
        self.write_quantized_float(-PI, PI, yaw_bits, x.atan2(z));
        self.write_quantized_float(-PI / 2.0, PI / 2.0, pitch_bits, (-y).clamp(-1.0, 1.0).asin());
    }

    /// 3D vector as fixed-point magnitude plus spherical direction. A vector
    /// whose quantized magnitude is zero costs only the magnitude bits.
    fn write_vec3(
        &mut self,
        x: f32,
        y: f32,
        z: f32,
        yaw_bits: u32,
        pitch_bits: u32,
        mag_int_bits: u32,
        mag_frac_bits: u32,
    ) {
        let total = mag_int_bits + mag_frac_bits;
        let max = ((1u64 << total) - 1) as f32;
        let length = (x * x + y * y + z * z).sqrt();
        let quantized = (length * (1u32 << mag_frac_bits) as f32 + 0.5).clamp(0.0, max) as u32;
        self.write_bits(quantized, total);
        if quantized != 0 {
            self.write_normalized_vec3(x / length, y / length, z / length, yaw_bits, pitch_bits);
        }
    }

    /// Packs several small independent values with mixed radices into a
    /// fixed `bits`-wide field, first element most significant.
    ///
    /// # Panics
    ///
    /// Panics if the radix product exceeds the field capacity or any value
    /// is out of range for its radix.
    fn write_arithmetic_encoded(&mut self, bits: u32, values: &[(u32, u32)]) {
        let mut combined: u64 = 0;
        let mut capacity: u64 = 1;
        for (value, radix) in values {
            assert!(value < radix, "arithmetic-coded value {value} >= radix {radix}");
            combined = combined * u64::from(*radix) + u64::from(*value);
            capacity *= u64::from(*radix);
        }
        assert!(capacity <= 1u64 << bits, "radix product overflows {bits}-bit field");
        self.write_bits(combined as u32, bits);
    }
}

/// A growable bit-level writer.
///
/// Finished buffers pad the final partial byte with zero bits.
#[derive(Debug, Default, Clone)]
pub struct BitWriter {
    buffer: Vec<u8>,
    scratch: u8,
    scratch_index: u8,
}

impl BitWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(bytes: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(bytes),
            scratch: 0,
            scratch_index: 0,
        }
    }

    /// Number of bits written so far.
    pub fn bits_written(&self) -> usize {
        self.buffer.len() * 8 + self.scratch_index as usize
    }

    /// Number of bytes `to_bytes` would produce (partial byte included).
    pub fn bytes_written(&self) -> usize {
        self.buffer.len() + usize::from(self.scratch_index > 0)
    }

    /// True if nothing has been written since creation or the last `reset`.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty() && self.scratch_index == 0
    }

    /// Clears the writer for reuse, keeping the allocation.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.scratch = 0;
        self.scratch_index = 0;
    }

    /// Copies out the written bytes, zero-padding the final partial byte.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = self.buffer.clone();
        if self.scratch_index > 0 {
            bytes.push(self.scratch);
        }
        bytes
    }
}

impl BitWrite for BitWriter {
    fn write_bit(&mut self, bit: bool) {
        if bit {
            self.scratch |= 1 << self.scratch_index;
        }
        self.scratch_index += 1;
        if self.scratch_index == 8 {
            self.buffer.push(self.scratch);
            self.scratch = 0;
            self.scratch_index = 0;
        }
    }
}
