//! Bit-level conversions between script words and host numbers.

use crate::{SWord, Word};

#[inline]
pub fn word_to_float(w: Word) -> f32 {
    f32::from_bits(w)
}

#[inline]
pub fn float_to_word(f: f32) -> Word {
    f.to_bits()
}

/// Low word first.
#[inline]
pub fn words_to_double(lo: Word, hi: Word) -> f64 {
    f64::from_bits(((hi as u64) << 32) | lo as u64)
}

#[inline]
pub fn double_to_words(d: f64) -> (Word, Word) {
    let bits = d.to_bits();
    (bits as Word, (bits >> 32) as Word)
}

/// 16.16 fixed point.
#[inline]
pub fn fixed_to_float(w: Word) -> f64 {
    w as SWord as f64 / 65536.0
}

#[inline]
pub fn float_to_fixed(f: f64) -> Word {
    (f * 65536.0) as SWord as Word
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn float_bits_survive_a_word() {
        let w = float_to_word(1.5);
        assert_eq!(w, 0x3FC0_0000);
        assert_eq!(word_to_float(w), 1.5);
    }

    #[test]
    fn double_splits_low_word_first() {
        let (lo, hi) = double_to_words(1.0);
        assert_eq!(lo, 0);
        assert_eq!(hi, 0x3FF0_0000);
        assert_eq!(words_to_double(lo, hi), 1.0);
    }

    #[test]
    fn fixed_point_is_signed() {
        assert_eq!(float_to_fixed(1.0), 0x0001_0000);
        assert_eq!(fixed_to_float(0x0000_8000), 0.5);
        assert_eq!(fixed_to_float(float_to_fixed(-2.25)), -2.25);
    }
}
