use std::f32::consts::PI;

use crate::error::{SerdeErr, SerdeResult};

/// Bit-level reader over a byte slice, mirroring [`BitWrite`](crate::BitWrite):
/// LSB-first within each byte, little-endian multi-byte values, no alignment.
///
/// All reads are bounds-checked and return [`SerdeErr::UnexpectedEnd`] when
/// the stream runs dry, so a malformed message can never read past its
/// buffer.
#[derive(Debug, Clone)]
pub struct BitReader<'a> {
    buffer: &'a [u8],
    bit_index: usize,
}

impl<'a> BitReader<'a> {
    pub fn new(buffer: &'a [u8]) -> Self {
        Self { buffer, bit_index: 0 }
    }

    /// Bits consumed so far.
    pub fn bits_read(&self) -> usize {
        self.bit_index
    }

    /// Bits remaining in the buffer.
    pub fn bits_left(&self) -> usize {
        self.buffer.len() * 8 - self.bit_index
    }

    pub fn is_empty(&self) -> bool {
        self.bits_left() == 0
    }

    fn check(&self, needed: usize) -> SerdeResult<()> {
        let available = self.bits_left();
        if needed > available {
            return Err(SerdeErr::UnexpectedEnd { needed, available });
        }
        Ok(())
    }

    pub fn read_bit(&mut self) -> SerdeResult<bool> {
        self.check(1)?;
        let byte = self.buffer[self.bit_index / 8];
        let bit = (byte >> (self.bit_index % 8)) & 1 != 0;
        self.bit_index += 1;
        Ok(bit)
    }

    pub fn read_byte(&mut self) -> SerdeResult<u8> {
        Ok(self.read_bits(8)? as u8)
    }

    /// Reads `bits` bits (<= 32), LSB first.
    pub fn read_bits(&mut self, bits: u32) -> SerdeResult<u32> {
        debug_assert!(bits <= 32, "read_bits supports at most 32 bits");
        self.check(bits as usize)?;
        let mut value: u32 = 0;
        for i in 0..bits {
            let byte = self.buffer[self.bit_index / 8];
            if (byte >> (self.bit_index % 8)) & 1 != 0 {
                value |= 1 << i;
            }
            self.bit_index += 1;
        }
        Ok(value)
    }

    pub fn read_bytes(&mut self, count: usize) -> SerdeResult<Vec<u8>> {
        self.check(count * 8)?;
        let mut bytes = Vec::with_capacity(count);
        for _ in 0..count {
            bytes.push(self.read_byte()?);
        }
        Ok(bytes)
    }

    /// Counterpart of [`BitWrite::write_vle_u32`](crate::BitWrite::write_vle_u32).
    pub fn read_vle_u32(&mut self) -> SerdeResult<u32> {
        let mut value = self.read_bits(7)?;
        if self.read_bit()? {
            value |= self.read_bits(7)? << 7;
            if self.read_bit()? {
                value |= self.read_bits(16)? << 14;
            }
        }
        Ok(value)
    }

    pub fn read_string(&mut self) -> SerdeResult<String> {
        let len = self.read_vle_u32()? as usize;
        let bytes = self.read_bytes(len)?;
        String::from_utf8(bytes).map_err(|_| SerdeErr::InvalidUtf8)
    }

    pub fn read_fixed_point(&mut self, int_bits: u32, frac_bits: u32) -> SerdeResult<f32> {
        let raw = self.read_bits(int_bits + frac_bits)?;
        Ok(raw as f32 / (1u32 << frac_bits) as f32)
    }

    pub fn read_signed_fixed_point(&mut self, int_bits: u32, frac_bits: u32) -> SerdeResult<f32> {
        Ok(self.read_fixed_point(int_bits, frac_bits)? - (1u32 << (int_bits - 1)) as f32)
    }

    pub fn read_quantized_float(&mut self, min: f32, max: f32, bits: u32) -> SerdeResult<f32> {
        let raw = self.read_bits(bits)?;
        Ok(Self::dequantize_float(min, max, bits, raw))
    }

    /// Reconstructs a float from a quantized pattern obtained via
    /// [`read_bits`](Self::read_bits), for callers that inspect the raw
    /// pattern first.
    pub fn dequantize_float(min: f32, max: f32, bits: u32, raw: u32) -> f32 {
        min + raw as f32 * (max - min) / ((1u64 << bits) - 1) as f32
    }

    pub fn read_normalized_vec2(&mut self, bits: u32) -> SerdeResult<(f32, f32)> {
        let angle = self.read_quantized_float(-PI, PI, bits)?;
        Ok((angle.cos(), angle.sin()))
    }

    pub fn read_normalized_vec3(&mut self, yaw_bits: u32, pitch_bits: u32) -> SerdeResult<(f32, f32, f32)> {
        let azimuth = self.read_quantized_float(-PI, PI, yaw_bits)?;
        let inclination = self.read_quantized_float(-PI / 2.0, PI / 2.0, pitch_bits)?;
        let radius = inclination.cos();
        Ok((radius * azimuth.sin(), -inclination.sin(), radius * azimuth.cos()))
    }

    pub fn read_vec3(
        &mut self,
        yaw_bits: u32,
        pitch_bits: u32,
        mag_int_bits: u32,
        mag_frac_bits: u32,
    ) -> SerdeResult<(f32, f32, f32)> {
        let raw = self.read_bits(mag_int_bits + mag_frac_bits)?;
        if raw == 0 {
            return Ok((0.0, 0.0, 0.0));
        }
        let length = raw as f32 / (1u32 << mag_frac_bits) as f32;
        let (x, y, z) = self.read_normalized_vec3(yaw_bits, pitch_bits)?;
        Ok((x * length, y * length, z * length))
    }

    /// Counterpart of
    /// [`BitWrite::write_arithmetic_encoded`](crate::BitWrite::write_arithmetic_encoded):
    /// unpacks `N` mixed-radix values, first element most significant.
    pub fn read_arithmetic_encoded<const N: usize>(
        &mut self,
        bits: u32,
        radices: [u32; N],
    ) -> SerdeResult<[u32; N]> {
        let mut combined = u64::from(self.read_bits(bits)?);
        let mut values = [0u32; N];
        for i in (0..N).rev() {
            values[i] = (combined % u64::from(radices[i])) as u32;
            combined /= u64::from(radices[i]);
        }
        Ok(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bit_writer::{BitWrite, BitWriter};

    #[test]
    fn read_past_end_fails() {
        let mut reader = BitReader::new(&[0xFF]);
        assert_eq!(reader.read_bits(8).unwrap(), 0xFF);
        assert!(matches!(
            reader.read_bit(),
            Err(SerdeErr::UnexpectedEnd { needed: 1, available: 0 })
        ));
    }

    #[test]
    fn vle_roundtrip() {
        for value in [0u32, 1, 127, 128, 300, 16383, 16384, 1_000_000, (1 << 30) - 1] {
            let mut writer = BitWriter::new();
            writer.write_vle_u32(value);
            let bytes = writer.to_bytes();
            let mut reader = BitReader::new(&bytes);
            assert_eq!(reader.read_vle_u32().unwrap(), value);
        }
    }

    #[test]
    fn string_roundtrip_unaligned() {
        let mut writer = BitWriter::new();
        writer.write_bit(true);
        writer.write_string("syncable ßcene");
        let bytes = writer.to_bytes();
        let mut reader = BitReader::new(&bytes);
        assert!(reader.read_bit().unwrap());
        assert_eq!(reader.read_string().unwrap(), "syncable ßcene");
    }

    #[test]
    fn signed_fixed_point_roundtrip() {
        for value in [-1023.5f32, -1.25, 0.0, 0.5, 713.25, 1023.0] {
            let mut writer = BitWriter::new();
            writer.write_signed_fixed_point(11, 8, value);
            let bytes = writer.to_bytes();
            let mut reader = BitReader::new(&bytes);
            let out = reader.read_signed_fixed_point(11, 8).unwrap();
            assert!((out - value).abs() <= 1.0 / 256.0, "{value} -> {out}");
        }
    }

    #[test]
    fn normalized_vec3_roundtrip() {
        let inputs = [
            (1.0f32, 0.0f32, 0.0f32),
            (0.0, 1.0, 0.0),
            (0.0, 0.0, -1.0),
            (0.5773503, -0.5773503, 0.5773503),
        ];
        for (x, y, z) in inputs {
            let mut writer = BitWriter::new();
            writer.write_normalized_vec3(x, y, z, 11, 10);
            let bytes = writer.to_bytes();
            let mut reader = BitReader::new(&bytes);
            let (ox, oy, oz) = reader.read_normalized_vec3(11, 10).unwrap();
            let dot = x * ox + y * oy + z * oz;
            assert!(dot > 0.9999, "({x},{y},{z}) -> ({ox},{oy},{oz}), dot {dot}");
        }
    }

    #[test]
    fn vec3_magnitude_and_direction() {
        let mut writer = BitWriter::new();
        writer.write_vec3(3.0, -4.0, 0.0, 11, 10, 10, 8);
        let bytes = writer.to_bytes();
        let mut reader = BitReader::new(&bytes);
        let (x, y, z) = reader.read_vec3(11, 10, 10, 8).unwrap();
        assert!((x - 3.0).abs() < 0.05);
        assert!((y + 4.0).abs() < 0.05);
        assert!(z.abs() < 0.05);
    }

    #[test]
    fn arithmetic_roundtrip_bit_positions_match() {
        let values = [(2u32, 3u32), (3, 4), (2, 3), (1, 3), (1, 2)];
        let mut writer = BitWriter::new();
        writer.write_arithmetic_encoded(8, &values);
        assert_eq!(writer.bits_written(), 8);
        let bytes = writer.to_bytes();
        let mut reader = BitReader::new(&bytes);
        let decoded = reader.read_arithmetic_encoded(8, [3, 4, 3, 3, 2]).unwrap();
        assert_eq!(decoded, [2, 3, 2, 1, 1]);
        assert_eq!(reader.bits_read(), 8);
    }
}
