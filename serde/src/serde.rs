use crate::{bit_reader::BitReader, bit_writer::BitWrite, error::SerdeResult};

/// A type with a canonical bit-stream representation.
pub trait Serde: Sized {
    fn ser(&self, writer: &mut dyn BitWrite);
    fn de(reader: &mut BitReader) -> SerdeResult<Self>;
}

impl Serde for bool {
    fn ser(&self, writer: &mut dyn BitWrite) {
        writer.write_bit(*self);
    }

    fn de(reader: &mut BitReader) -> SerdeResult<Self> {
        reader.read_bit()
    }
}

impl Serde for u8 {
    fn ser(&self, writer: &mut dyn BitWrite) {
        writer.write_byte(*self);
    }

    fn de(reader: &mut BitReader) -> SerdeResult<Self> {
        reader.read_byte()
    }
}

macro_rules! impl_serde_le_int {
    ($t:ty, $bytes:expr) => {
        impl Serde for $t {
            fn ser(&self, writer: &mut dyn BitWrite) {
                for byte in self.to_le_bytes() {
                    writer.write_byte(byte);
                }
            }

            fn de(reader: &mut BitReader) -> SerdeResult<Self> {
                let mut bytes = [0u8; $bytes];
                for byte in bytes.iter_mut() {
                    *byte = reader.read_byte()?;
                }
                Ok(<$t>::from_le_bytes(bytes))
            }
        }
    };
}

impl_serde_le_int!(u16, 2);
impl_serde_le_int!(u32, 4);
impl_serde_le_int!(u64, 8);
impl_serde_le_int!(i8, 1);
impl_serde_le_int!(i16, 2);
impl_serde_le_int!(i32, 4);
impl_serde_le_int!(i64, 8);

impl Serde for f32 {
    fn ser(&self, writer: &mut dyn BitWrite) {
        self.to_bits().ser(writer);
    }

    fn de(reader: &mut BitReader) -> SerdeResult<Self> {
        Ok(f32::from_bits(u32::de(reader)?))
    }
}

impl Serde for f64 {
    fn ser(&self, writer: &mut dyn BitWrite) {
        self.to_bits().ser(writer);
    }

    fn de(reader: &mut BitReader) -> SerdeResult<Self> {
        Ok(f64::from_bits(u64::de(reader)?))
    }
}

impl Serde for String {
    fn ser(&self, writer: &mut dyn BitWrite) {
        writer.write_string(self);
    }

    fn de(reader: &mut BitReader) -> SerdeResult<Self> {
        reader.read_string()
    }
}
