//! IEEE 754 binary16 <-> binary32 conversion for half-precision tensors.
//!
//! Encoding rounds to nearest, ties to even. Overflow saturates to signed
//! infinity and NaN keeps its sign with the quiet bit set.

use half::f16;

/// Encode an `f32` as half-precision bits.
pub fn f32_to_f16_bits(value: f32) -> u16 {
    f16::from_f32(value).to_bits()
}

/// Decode half-precision bits into an `f32`.
pub fn f16_bits_to_f32(h: u16) -> f32 {
    f16::from_bits(h).to_f32()
}

/// Convert a slice of `f32` into runtime half values.
pub fn encode_slice(src: &[f32]) -> Vec<f16> {
    src.iter().copied().map(f16::from_f32).collect()
}

/// Convert runtime half values into `f32`, writing as many as fit in `dst`.
pub fn decode_into<'a, I>(src: I, dst: &mut [f32]) -> usize
where
    I: IntoIterator<Item = &'a f16>,
{
    let mut n = 0;
    for (d, s) in dst.iter_mut().zip(src) {
        *d = s.to_f32();
        n += 1;
    }
    n
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(v: f32) -> f32 {
        f16_bits_to_f32(f32_to_f16_bits(v))
    }

    #[test]
    fn signed_zero_preserved() {
        assert_eq!(f32_to_f16_bits(0.0), 0x0000);
        assert_eq!(f32_to_f16_bits(-0.0), 0x8000);
        let nz = round_trip(-0.0);
        assert_eq!(nz, 0.0);
        assert!(nz.is_sign_negative());
    }

    #[test]
    fn smallest_denormal_round_trips() {
        let tiny = f16_bits_to_f32(0x0001);
        assert_eq!(tiny, 2.0f32.powi(-24));
        assert_eq!(f32_to_f16_bits(tiny), 0x0001);
        assert_eq!(f32_to_f16_bits(-tiny), 0x8001);
    }

    #[test]
    fn largest_denormal_decodes() {
        let v = f16_bits_to_f32(0x03ff);
        assert_eq!(v, 1023.0 * 2.0f32.powi(-24));
        assert_eq!(f32_to_f16_bits(v), 0x03ff);
    }

    #[test]
    fn infinities_and_overflow() {
        assert_eq!(f32_to_f16_bits(f32::INFINITY), 0x7c00);
        assert_eq!(f32_to_f16_bits(f32::NEG_INFINITY), 0xfc00);
        assert_eq!(f32_to_f16_bits(1.0e6), 0x7c00);
        assert_eq!(f32_to_f16_bits(-70000.0), 0xfc00);
        assert_eq!(round_trip(f32::INFINITY), f32::INFINITY);
        assert_eq!(round_trip(f32::NEG_INFINITY), f32::NEG_INFINITY);
    }

    #[test]
    fn nan_stays_nan_with_sign() {
        let h = f32_to_f16_bits(f32::NAN);
        assert_eq!(h & 0x7c00, 0x7c00);
        assert_ne!(h & 0x03ff, 0);
        assert!(round_trip(f32::NAN).is_nan());
        let neg = f32::from_bits(0xffc0_0000);
        assert!(round_trip(neg).is_nan());
        assert!(round_trip(neg).is_sign_negative());
    }

    #[test]
    fn underflow_goes_to_signed_zero() {
        assert_eq!(f32_to_f16_bits(1.0e-10), 0x0000);
        assert_eq!(f32_to_f16_bits(-1.0e-10), 0x8000);
        assert_eq!(f32_to_f16_bits(f32::MIN_POSITIVE), 0x0000);
    }

    #[test]
    fn normals_exact_where_representable() {
        for v in [1.0f32, -2.5, 0.5, 65504.0, 2.0f32.powi(-14)] {
            assert_eq!(round_trip(v), v);
        }
        assert_eq!(f32_to_f16_bits(1.0), 0x3c00);
        assert_eq!(f32_to_f16_bits(65504.0), 0x7bff);
    }

    #[test]
    fn encoding_rounds_to_nearest_even() {
        let ulp = 2.0f32.powi(-10);
        // halfway between 1.0 and the next half, ties to the even mantissa
        assert_eq!(f32_to_f16_bits(1.0 + ulp / 2.0), 0x3c00);
        assert_eq!(f32_to_f16_bits(1.0 + ulp * 1.5), 0x3c02);
        // just above halfway rounds up
        assert_eq!(f32_to_f16_bits(1.0 + ulp * 0.75), 0x3c01);
        assert_eq!(f32_to_f16_bits(65519.0), 0x7bff);
        assert_eq!(f32_to_f16_bits(65520.0), 0x7c00);
    }

    #[test]
    fn slice_helpers() {
        let enc = encode_slice(&[1.0, -2.0, 0.5]);
        let mut out = [0.0f32; 2];
        let n = decode_into(enc.iter(), &mut out);
        assert_eq!(n, 2);
        assert_eq!(out, [1.0, -2.0]);
    }
}
