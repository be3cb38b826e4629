//! Heap bignum objects.
//!
//! Only the surface the core needs is implemented here: construction
//! (fixnum overflow promotion, shifts past the fixnum range, 64-bit
//! counters), comparison, and decimal formatting for diagnostics. The
//! rest of the numeric tower lives outside the VM.
//!
//! Layout: header, a capacity fixnum counting the sign cell plus the
//! limb cells, a sign cell (0 positive, 1 negative), then 32-bit limbs
//! least significant first. Zero is one zero limb with positive sign.

use crate::{
    cell::{retag, tag_fixnum, untag, Cell, Fixnum, Tag, FIXNUM_MAX, FIXNUM_MIN},
    object::{BIGNUM_CAPACITY, BIGNUM_LIMBS, BIGNUM_SIGN},
    vm::Vm,
};

impl Vm
{
    /// Allocate a bignum from sign and little-endian limbs. The limbs
    /// must already be normalized (no leading zero limb, except the
    /// single zero limb of zero itself).
    pub fn allot_bignum(&mut self, negative: bool, limbs: &[u32]) -> Cell
    {
        debug_assert!(!limbs.is_empty());
        debug_assert!(limbs.len() == 1 || *limbs.last().unwrap() != 0);

        let capacity = 1 + limbs.len() as Cell;
        let obj = self.allot_object(
            Tag::Bignum,
            crate::object::bignum_size_for(capacity),
        );
        self.heap.mem.set_cell(
            obj + BIGNUM_CAPACITY,
            tag_fixnum(capacity as Fixnum),
        );
        self.heap.mem.set_cell(obj + BIGNUM_SIGN, negative as Cell);
        for (index, &limb) in limbs.iter().enumerate() {
            self.heap.mem.set_cell(obj + BIGNUM_LIMBS + index as Cell * 4, limb);
        }
        retag(obj, Tag::Bignum as Cell)
    }

    pub fn allot_bignum_from_i64(&mut self, value: i64) -> Cell
    {
        let negative = value < 0;
        self.allot_bignum_from_magnitude(negative, value.unsigned_abs())
    }

    pub fn allot_bignum_from_u64(&mut self, magnitude: u64) -> Cell
    {
        self.allot_bignum_from_magnitude(false, magnitude)
    }

    fn allot_bignum_from_magnitude(&mut self, negative: bool, magnitude: u64)
        -> Cell
    {
        let low = magnitude as u32;
        let high = (magnitude >> 32) as u32;
        if high == 0 {
            self.allot_bignum(negative && low != 0, &[low])
        } else {
            self.allot_bignum(negative, &[low, high])
        }
    }

    /// A fixnum magnitude shifted left by an arbitrary bit count.
    /// Covers `fixnum-shift` results beyond the fixnum range.
    pub fn allot_bignum_shifted(&mut self, value: Fixnum, shift: u32) -> Cell
    {
        let negative = value < 0;
        let magnitude = value.unsigned_abs() as u64;
        if magnitude == 0 {
            return self.allot_bignum(false, &[0]);
        }

        let limb_offset = (shift / 32) as usize;
        let bit_offset = shift % 32;
        let shifted = (magnitude as u128) << bit_offset;

        let mut limbs = vec![0u32; limb_offset];
        limbs.push(shifted as u32);
        limbs.push((shifted >> 32) as u32);
        limbs.push((shifted >> 64) as u32);
        while limbs.len() > 1 && *limbs.last().unwrap() == 0 {
            limbs.pop();
        }
        self.allot_bignum(negative, &limbs)
    }

    fn bignum_limbs(&self, tagged: Cell) -> (bool, Vec<u32>)
    {
        let obj = untag(tagged);
        let capacity = crate::cell::untag_fixnum(
            self.heap.mem.cell_at(obj + BIGNUM_CAPACITY),
        ) as Cell;
        let negative = self.heap.mem.cell_at(obj + BIGNUM_SIGN) != 0;
        let limbs = (0..capacity - 1)
            .map(|i| self.heap.mem.cell_at(obj + BIGNUM_LIMBS + i * 4))
            .collect();
        (negative, limbs)
    }

    /// The value, when it fits in an i64.
    pub fn bignum_to_i64(&self, tagged: Cell) -> Option<i64>
    {
        let (negative, limbs) = self.bignum_limbs(tagged);
        let mut magnitude: u64 = 0;
        for (index, &limb) in limbs.iter().enumerate() {
            if limb != 0 {
                if index >= 2 {
                    return None;
                }
                magnitude |= (limb as u64) << (32 * index);
            }
        }
        if negative {
            (magnitude <= 1 << 63).then(|| (magnitude as i64).wrapping_neg())
        } else {
            (magnitude <= i64::MAX as u64).then_some(magnitude as i64)
        }
    }

    /// Demote to a fixnum when the value is in range.
    pub fn bignum_to_fixnum(&self, tagged: Cell) -> Option<Fixnum>
    {
        let value = self.bignum_to_i64(tagged)?;
        ((FIXNUM_MIN as i64..=FIXNUM_MAX as i64).contains(&value))
            .then_some(value as Fixnum)
    }

    pub fn bignum_eq(&self, a: Cell, b: Cell) -> bool
    {
        self.bignum_limbs(a) == self.bignum_limbs(b)
    }

    /// Decimal rendering, for the debugger and `.`-style output.
    pub fn bignum_to_decimal(&self, tagged: Cell) -> String
    {
        let (negative, mut limbs) = self.bignum_limbs(tagged);
        let mut digits = String::new();
        loop {
            // Divide the limb vector by 1e9, most significant first.
            let mut remainder: u64 = 0;
            for limb in limbs.iter_mut().rev() {
                let value = (remainder << 32) | *limb as u64;
                *limb = (value / 1_000_000_000) as u32;
                remainder = value % 1_000_000_000;
            }
            while limbs.len() > 1 && *limbs.last().unwrap() == 0 {
                limbs.pop();
            }
            if limbs == [0] {
                digits.insert_str(0, &remainder.to_string());
                break;
            }
            digits.insert_str(0, &format!("{remainder:09}"));
        }
        if negative && digits != "0" {
            digits.insert(0, '-');
        }
        digits
    }
}

#[cfg(test)]
mod tests
{
    use {
        super::*,
        crate::vm::VmParameters,
    };

    fn vm() -> Vm
    {
        Vm::new(VmParameters::default())
    }

    #[test]
    fn promotion_round_trips_through_i64()
    {
        let mut vm = vm();
        for value in [
            0i64,
            1,
            -1,
            FIXNUM_MAX as i64 + 1,
            FIXNUM_MIN as i64 - 1,
            u32::MAX as i64 + 7,
            i64::MIN + 1,
        ] {
            let bignum = vm.allot_bignum_from_i64(value);
            assert_eq!(vm.bignum_to_i64(bignum), Some(value), "value {value}");
        }
    }

    #[test]
    fn shifted_values_format_in_decimal()
    {
        let mut vm = vm();
        let bignum = vm.allot_bignum_shifted(1, 64);
        assert_eq!(vm.bignum_to_decimal(bignum), "18446744073709551616");
        assert_eq!(vm.bignum_to_i64(bignum), None);

        let small = vm.allot_bignum_from_i64(-90071);
        assert_eq!(vm.bignum_to_decimal(small), "-90071");
    }

    #[test]
    fn fixnum_demotion_respects_range()
    {
        let mut vm = vm();
        let in_range = vm.allot_bignum_from_i64(12345);
        assert_eq!(vm.bignum_to_fixnum(in_range), Some(12345));
        let out_of_range = vm.allot_bignum_from_i64(FIXNUM_MAX as i64 + 1);
        assert_eq!(vm.bignum_to_fixnum(out_of_range), None);
    }
}
