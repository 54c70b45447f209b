//! The constant pool: deduplicated literal data emitted after the code.
//!
//! Bit patterns are keyed by their unsigned interpretation per width, so
//! `-1i32` and `0xffff_ffffu32` share a label; floats and doubles enter by
//! their IEEE bits. Interning the same value twice always yields the same
//! label. The pool is per compilation, shared by all functions.

use crate::ir::Type;
use std::collections::BTreeMap;
use std::fmt::Write;

/// A per-compilation pool of literal constants.
#[derive(Default)]
pub struct ConstantPool {
    counter: u32,
    bytes: BTreeMap<u8, u32>,
    shorts: BTreeMap<u16, u32>,
    longs: BTreeMap<u32, u32>,
    quads: BTreeMap<u64, u32>,
    octs: BTreeMap<u128, u32>,
}

impl ConstantPool {
    /// Create an empty pool.
    pub fn new() -> Self {
        Self::default()
    }

    fn next(counter: &mut u32) -> u32 {
        *counter += 1;
        *counter
    }

    /// Intern a 1-byte pattern, returning its label number.
    pub fn intern_u8(&mut self, bits: u8) -> u32 {
        let c = &mut self.counter;
        *self.bytes.entry(bits).or_insert_with(|| Self::next(c))
    }

    /// Intern a 2-byte pattern.
    pub fn intern_u16(&mut self, bits: u16) -> u32 {
        let c = &mut self.counter;
        *self.shorts.entry(bits).or_insert_with(|| Self::next(c))
    }

    /// Intern a 4-byte pattern.
    pub fn intern_u32(&mut self, bits: u32) -> u32 {
        let c = &mut self.counter;
        *self.longs.entry(bits).or_insert_with(|| Self::next(c))
    }

    /// Intern an 8-byte pattern.
    pub fn intern_u64(&mut self, bits: u64) -> u32 {
        let c = &mut self.counter;
        *self.quads.entry(bits).or_insert_with(|| Self::next(c))
    }

    /// Intern a 16-byte pattern.
    pub fn intern_u128(&mut self, bits: u128) -> u32 {
        let c = &mut self.counter;
        *self.octs.entry(bits).or_insert_with(|| Self::next(c))
    }

    /// Intern a float by its IEEE bit pattern.
    pub fn intern_f32(&mut self, value: f32) -> u32 {
        self.intern_u32(value.to_bits())
    }

    /// Intern a double by its IEEE bit pattern.
    pub fn intern_f64(&mut self, value: f64) -> u32 {
        self.intern_u64(value.to_bits())
    }

    /// Intern a bit pattern according to the width of `ty`.
    pub fn intern_typed(&mut self, ty: Type, bits: u64) -> u32 {
        match ty.bytes() {
            1 => self.intern_u8(bits as u8),
            2 => self.intern_u16(bits as u16),
            4 => self.intern_u32(bits as u32),
            _ => self.intern_u64(bits),
        }
    }

    /// Emit the pool: each width group under its `.align`, every constant
    /// as `.LCn`, followed by the fixed sign-mask labels the emitter uses
    /// for unary minus. The float masks are padded to 16 bytes so they can
    /// serve as `xorps`/`xorpd` memory operands.
    pub fn dump(&self, out: &mut String) {
        for (bits, label) in &self.bytes {
            let _ = writeln!(out, ".LC{}:\n\t.byte {}", label, bits);
        }
        let _ = writeln!(out, ".LCS8:\n\t.byte {}", 0x80u8);

        let _ = writeln!(out, "\t.align\t2");
        for (bits, label) in &self.shorts {
            let _ = writeln!(out, ".LC{}:\n\t.short {}", label, bits);
        }
        let _ = writeln!(out, ".LCS16:\n\t.short {}", 0x8000u16);

        let _ = writeln!(out, "\t.align\t4");
        for (bits, label) in &self.longs {
            let _ = writeln!(out, ".LC{}:\n\t.long {}", label, bits);
        }
        let _ = writeln!(out, "\t.align\t16");
        let _ = writeln!(
            out,
            ".LCS32:\n\t.long {}\n\t.long 0\n\t.long 0\n\t.long 0",
            0x8000_0000u32
        );

        let _ = writeln!(out, "\t.align\t8");
        for (bits, label) in &self.quads {
            let _ = writeln!(out, ".LC{}:\n\t.quad {}", label, bits);
        }
        let _ = writeln!(out, "\t.align\t16");
        let _ = writeln!(
            out,
            ".LCS64:\n\t.quad {}\n\t.quad 0",
            0x8000_0000_0000_0000u64
        );

        let _ = writeln!(out, "\t.align\t16");
        for (bits, label) in &self.octs {
            let lo = (*bits & 0xffff_ffff_ffff_ffff) as u64;
            let hi = (*bits >> 64) as u64;
            let _ = writeln!(out, ".LC{}:\n\t.quad {}\n\t.quad {}", label, lo, hi);
        }
        let _ = writeln!(out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idempotent_labels() {
        let mut pool = ConstantPool::new();
        let a = pool.intern_u32(42);
        let b = pool.intern_u32(42);
        assert_eq!(a, b);
        let c = pool.intern_u32(43);
        assert_ne!(a, c);
        // Same value, different width: distinct labels.
        let d = pool.intern_u64(42);
        assert_ne!(a, d);
    }

    #[test]
    fn floats_keyed_by_bits() {
        let mut pool = ConstantPool::new();
        let a = pool.intern_f32(1.5);
        let b = pool.intern_u32(1.5f32.to_bits());
        assert_eq!(a, b);
        let c = pool.intern_f64(1.5);
        assert_ne!(a, c);
    }

    #[test]
    fn dump_contains_masks() {
        let mut pool = ConstantPool::new();
        pool.intern_u32(7);
        let mut out = String::new();
        pool.dump(&mut out);
        assert!(out.contains(".LCS8:"));
        assert!(out.contains(".LCS16:"));
        assert!(out.contains(".LCS32:"));
        assert!(out.contains(".LCS64:"));
        assert!(out.contains(".LC1:"));
        assert!(out.contains(".align\t4"));
    }

    proptest::proptest! {
        #[test]
        fn interning_is_stable(values in proptest::collection::vec(0u64..1u64 << 48, 1..30)) {
            let mut pool = ConstantPool::new();
            let first: Vec<u32> = values.iter().map(|&v| pool.intern_u64(v)).collect();
            let second: Vec<u32> = values.iter().map(|&v| pool.intern_u64(v)).collect();
            proptest::prop_assert_eq!(first, second);
        }
    }
}
