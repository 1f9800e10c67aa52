use rust_decimal::{prelude::FromPrimitive, Decimal};

use super::register::{Encoding, RegisterSpec};
use crate::error::DecodeError;

/// Fractional digits kept from float32 registers; anything past this is representation noise.
const F32_DIGITS: u32 = 4;

/// Interpret the raw register words of `spec` and apply its scale.
///
/// Registers are big-endian. 32-bit values are high word first unless `swap_words` is set. Signed
/// encodings are read as two's complement before scaling.
pub fn decode(spec: &RegisterSpec, words: &[u16]) -> Result<Decimal, DecodeError> {
    let expected = usize::from(spec.word_count());
    if words.len() != expected {
        return Err(DecodeError::SizeMismatch {
            expected,
            actual: words.len(),
        });
    }

    let words = spec.apply_swaps(words);
    let joined = || (u32::from(words[0]) << 16) | u32::from(words[1]);

    let raw = match spec.encoding {
        Encoding::I16 => Decimal::from(words[0] as i16),
        Encoding::U16 => Decimal::from(words[0]),
        Encoding::I32 => Decimal::from(joined() as i32),
        Encoding::U32 => Decimal::from(joined()),
        Encoding::F32 => {
            let value = f32::from_bits(joined());
            if !value.is_finite() {
                return Err(DecodeError::NotFinite);
            }
            Decimal::from_f32(value).ok_or(DecodeError::OutOfRange)?
        }
    };

    let scaled = raw
        .checked_mul(spec.scale)
        .ok_or(DecodeError::OutOfRange)?;

    Ok(match spec.encoding {
        Encoding::F32 => scaled.round_dp(F32_DIGITS),
        _ => scaled,
    })
}

impl RegisterSpec {
    pub fn decode(&self, words: &[u16]) -> Result<Decimal, DecodeError> {
        decode(self, words)
    }

    /// Word order only exists for multi-register values; single registers pass through untouched.
    pub fn apply_swaps(&self, words: &[u16]) -> Vec<u16> {
        if self.swap_words && self.encoding.size() == 2 {
            words
                .chunks_exact(2)
                .flat_map(|chunk| [chunk[1], chunk[0]])
                .collect()
        } else {
            words.into()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modbus::register::Quantity;
    use pretty_assertions::assert_eq;
    use rust_decimal::prelude::ToPrimitive;

    fn register(encoding: Encoding, scale: Decimal) -> RegisterSpec {
        RegisterSpec::new("test", 0x2000, encoding, scale, Quantity::Power)
    }

    /// Inverse of `decode` for the integer encodings.
    fn encode(spec: &RegisterSpec, value: Decimal) -> Vec<u16> {
        let raw = (value / spec.scale).round().to_i64().unwrap();
        let words = match spec.encoding {
            Encoding::I16 => vec![raw as i16 as u16],
            Encoding::U16 => vec![raw as u16],
            Encoding::I32 => {
                let bits = raw as i32 as u32;
                vec![(bits >> 16) as u16, bits as u16]
            }
            Encoding::U32 => {
                let bits = raw as u32;
                vec![(bits >> 16) as u16, bits as u16]
            }
            Encoding::F32 => unreachable!("integer encodings only"),
        };
        spec.apply_swaps(&words)
    }

    #[test]
    fn int32_voltage_end_to_end_value() {
        let spec = register(Encoding::I32, Decimal::new(1, 1));
        let value = decode(&spec, &[0x0000, 0x0898]).unwrap();
        assert_eq!(value, Decimal::new(2200, 1));
        assert_eq!(value.to_string(), "220.0");
    }

    #[test]
    fn round_trips_integer_encodings() {
        let cases: Vec<(Encoding, Decimal, Vec<Decimal>)> = vec![
            (
                Encoding::I16,
                Decimal::new(1, 1),
                vec![Decimal::new(-32768, 1), Decimal::ZERO, Decimal::new(32767, 1)],
            ),
            (
                Encoding::U16,
                Decimal::new(1, 2),
                vec![Decimal::ZERO, Decimal::new(4999, 2), Decimal::new(65535, 2)],
            ),
            (
                Encoding::I32,
                Decimal::new(1, 3),
                vec![
                    Decimal::new(i64::from(i32::MIN), 3),
                    Decimal::new(-1, 3),
                    Decimal::new(i64::from(i32::MAX), 3),
                ],
            ),
            (
                Encoding::U32,
                Decimal::ONE,
                vec![Decimal::ZERO, Decimal::from(70_000), Decimal::from(u32::MAX)],
            ),
        ];

        for (encoding, scale, values) in cases {
            for swap_words in [false, true] {
                let mut spec = register(encoding, scale);
                spec.swap_words = swap_words;
                for value in &values {
                    let words = encode(&spec, *value);
                    assert_eq!(decode(&spec, &words).unwrap(), *value, "{spec} {words:?}");
                }
            }
        }
    }

    #[test]
    fn signed_values_use_twos_complement() {
        let spec16 = register(Encoding::I16, Decimal::ONE);
        assert_eq!(decode(&spec16, &[0xFFFF]).unwrap(), Decimal::from(-1));
        assert_eq!(decode(&spec16, &[0x8000]).unwrap(), Decimal::from(-32768));

        let spec32 = register(Encoding::I32, Decimal::new(1, 1));
        assert_eq!(
            decode(&spec32, &[0xFFFF, 0xFF38]).unwrap(),
            Decimal::new(-200, 1)
        );

        let unsigned = register(Encoding::U16, Decimal::ONE);
        assert_eq!(decode(&unsigned, &[0xFFFF]).unwrap(), Decimal::from(65535));
    }

    #[test]
    fn float32_high_word_first() {
        let spec = register(Encoding::F32, Decimal::new(1, 1));
        let bits = 2301.5f32.to_bits();
        let value = decode(&spec, &[(bits >> 16) as u16, bits as u16]).unwrap();
        assert_eq!(value, Decimal::new(23015, 2));
    }

    #[test]
    fn float32_swapped_words() {
        let mut spec = register(Encoding::F32, Decimal::ONE);
        spec.swap_words = true;
        let bits = 50.0f32.to_bits();
        let value = decode(&spec, &[bits as u16, (bits >> 16) as u16]).unwrap();
        assert_eq!(value, Decimal::from(50));
    }

    #[test]
    fn float32_nan_is_rejected() {
        let spec = register(Encoding::F32, Decimal::ONE);
        let bits = f32::NAN.to_bits();
        assert_eq!(
            decode(&spec, &[(bits >> 16) as u16, bits as u16]),
            Err(DecodeError::NotFinite)
        );
    }

    #[test]
    fn swap_words_leaves_single_registers_alone() {
        for encoding in [Encoding::I16, Encoding::U16] {
            let mut spec = register(encoding, Decimal::ONE);
            spec.swap_words = true;
            assert_eq!(spec.apply_swaps(&[0x0042]), vec![0x0042]);
            assert_eq!(decode(&spec, &[0x0042]).unwrap(), Decimal::from(0x42));
        }
    }

    #[test]
    fn float32_beyond_decimal_range_is_out_of_range() {
        let spec = register(Encoding::F32, Decimal::ONE);
        let bits = f32::MAX.to_bits();
        assert_eq!(
            decode(&spec, &[(bits >> 16) as u16, bits as u16]),
            Err(DecodeError::OutOfRange)
        );
    }

    #[test]
    fn scale_overflow_is_out_of_range() {
        let spec = register(Encoding::U32, Decimal::MAX);
        assert_eq!(
            decode(&spec, &[0xFFFF, 0xFFFF]),
            Err(DecodeError::OutOfRange)
        );
    }

    #[test]
    fn wrong_word_count_is_size_mismatch() {
        let spec = register(Encoding::I32, Decimal::ONE);
        assert_eq!(
            decode(&spec, &[1]),
            Err(DecodeError::SizeMismatch {
                expected: 2,
                actual: 1
            })
        );
        let spec = register(Encoding::U16, Decimal::ONE);
        assert_eq!(
            decode(&spec, &[1, 2]),
            Err(DecodeError::SizeMismatch {
                expected: 1,
                actual: 2
            })
        );
    }
}
