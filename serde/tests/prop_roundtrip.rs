//! Property tests: everything the writer produces, the reader reconstructs
//! at the same bit position.

use proptest::prelude::*;

use undine_serde::{BitReader, BitWrite, BitWriter, Serde};

proptest! {
    #[test]
    fn bits_roundtrip(value in 0u32..=u32::MAX, bits in 1u32..=32) {
        let masked = if bits == 32 { value } else { value & ((1 << bits) - 1) };
        let mut writer = BitWriter::new();
        writer.write_bits(masked, bits);
        let bytes = writer.to_bytes();
        let mut reader = BitReader::new(&bytes);
        prop_assert_eq!(reader.read_bits(bits).unwrap(), masked);
        prop_assert_eq!(reader.bits_read(), bits as usize);
    }

    #[test]
    fn vle_roundtrip(value in 0u32..(1 << 30)) {
        let mut writer = BitWriter::new();
        writer.write_vle_u32(value);
        let bytes = writer.to_bytes();
        let mut reader = BitReader::new(&bytes);
        prop_assert_eq!(reader.read_vle_u32().unwrap(), value);
        prop_assert_eq!(reader.bits_read(), writer.bits_written());
    }

    #[test]
    fn signed_fixed_point_tolerance(value in -1000.0f32..1000.0) {
        let mut writer = BitWriter::new();
        writer.write_signed_fixed_point(11, 8, value);
        let bytes = writer.to_bytes();
        let mut reader = BitReader::new(&bytes);
        let out = reader.read_signed_fixed_point(11, 8).unwrap();
        prop_assert!((out - value).abs() <= 1.0 / 256.0);
    }

    #[test]
    fn quantized_float_tolerance(value in 0.0f32..std::f32::consts::PI) {
        let mut writer = BitWriter::new();
        writer.write_quantized_float(0.0, std::f32::consts::PI, 10, value);
        let bytes = writer.to_bytes();
        let mut reader = BitReader::new(&bytes);
        let out = reader.read_quantized_float(0.0, std::f32::consts::PI, 10).unwrap();
        prop_assert!((out - value).abs() <= std::f32::consts::PI / 1023.0);
    }

    #[test]
    fn vec3_roundtrip(
        x in -60.0f32..60.0,
        y in -60.0f32..60.0,
        z in -60.0f32..60.0,
    ) {
        let mut writer = BitWriter::new();
        writer.write_vec3(x, y, z, 11, 10, 10, 8);
        let bytes = writer.to_bytes();
        let mut reader = BitReader::new(&bytes);
        let (ox, oy, oz) = reader.read_vec3(11, 10, 10, 8).unwrap();
        let len = (x * x + y * y + z * z).sqrt();
        // Direction quantization error scales with magnitude.
        let tolerance = 0.01 + len * 0.01;
        prop_assert!((ox - x).abs() <= tolerance, "x: {} -> {}", x, ox);
        prop_assert!((oy - y).abs() <= tolerance, "y: {} -> {}", y, oy);
        prop_assert!((oz - z).abs() <= tolerance, "z: {} -> {}", z, oz);
    }

    #[test]
    fn strings_roundtrip(text in "\\PC{0,64}") {
        let mut writer = BitWriter::new();
        writer.write_bit(true); // misalign on purpose
        writer.write_string(&text);
        let bytes = writer.to_bytes();
        let mut reader = BitReader::new(&bytes);
        reader.read_bit().unwrap();
        prop_assert_eq!(reader.read_string().unwrap(), text);
    }

    #[test]
    fn serde_u64_roundtrip(value in any::<u64>()) {
        let mut writer = BitWriter::new();
        value.ser(&mut writer);
        let bytes = writer.to_bytes();
        let mut reader = BitReader::new(&bytes);
        prop_assert_eq!(u64::de(&mut reader).unwrap(), value);
    }
}
