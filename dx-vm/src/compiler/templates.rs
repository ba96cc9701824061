//! Out-of-line helpers called from compiled code.
//!
//! Every template takes up to four 32-bit words in the target's argument registers and returns
//! one or two words in its return registers. Wide values travel as `(lo, hi)`.

use crate::address_space::{TEMPLATE_BASE, TEMPLATE_STRIDE};
use crate::arith;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Template {
    AddFloat,
    SubFloat,
    MulFloat,
    DivFloat,
    RemFloat,
    AddDouble,
    SubDouble,
    MulDouble,
    DivDouble,
    RemDouble,
    CmplFloat,
    CmpgFloat,
    CmplDouble,
    CmpgDouble,
    CmpLong,
    MulLong,
    ShlLong,
    ShrLong,
    UshrLong,
    DivInt,
    RemInt,
    DivLong,
    RemLong,
    IntToFloat,
    IntToDouble,
    LongToFloat,
    LongToDouble,
    FloatToInt,
    FloatToLong,
    FloatToDouble,
    DoubleToInt,
    DoubleToLong,
    DoubleToFloat,
}

const ALL: [Template; 33] = [
    Template::AddFloat,
    Template::SubFloat,
    Template::MulFloat,
    Template::DivFloat,
    Template::RemFloat,
    Template::AddDouble,
    Template::SubDouble,
    Template::MulDouble,
    Template::DivDouble,
    Template::RemDouble,
    Template::CmplFloat,
    Template::CmpgFloat,
    Template::CmplDouble,
    Template::CmpgDouble,
    Template::CmpLong,
    Template::MulLong,
    Template::ShlLong,
    Template::ShrLong,
    Template::UshrLong,
    Template::DivInt,
    Template::RemInt,
    Template::DivLong,
    Template::RemLong,
    Template::IntToFloat,
    Template::IntToDouble,
    Template::LongToFloat,
    Template::LongToDouble,
    Template::FloatToInt,
    Template::FloatToLong,
    Template::FloatToDouble,
    Template::DoubleToInt,
    Template::DoubleToLong,
    Template::DoubleToFloat,
];

/// Divisor was zero; compiled code checks first, so reaching this is a codegen bug.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DivideByZero;

impl Template {
    pub fn address(self) -> u32 {
        TEMPLATE_BASE + self as u32 * TEMPLATE_STRIDE
    }

    pub fn at(address: u32) -> Option<Self> {
        if address < TEMPLATE_BASE || (address - TEMPLATE_BASE) % TEMPLATE_STRIDE != 0 {
            return None;
        }
        ALL.get(((address - TEMPLATE_BASE) / TEMPLATE_STRIDE) as usize)
            .copied()
    }

    pub fn name(self) -> &'static str {
        match self {
            Template::AddFloat => "add-float",
            Template::SubFloat => "sub-float",
            Template::MulFloat => "mul-float",
            Template::DivFloat => "div-float",
            Template::RemFloat => "rem-float",
            Template::AddDouble => "add-double",
            Template::SubDouble => "sub-double",
            Template::MulDouble => "mul-double",
            Template::DivDouble => "div-double",
            Template::RemDouble => "rem-double",
            Template::CmplFloat => "cmpl-float",
            Template::CmpgFloat => "cmpg-float",
            Template::CmplDouble => "cmpl-double",
            Template::CmpgDouble => "cmpg-double",
            Template::CmpLong => "cmp-long",
            Template::MulLong => "mul-long",
            Template::ShlLong => "shl-long",
            Template::ShrLong => "shr-long",
            Template::UshrLong => "ushr-long",
            Template::DivInt => "div-int",
            Template::RemInt => "rem-int",
            Template::DivLong => "div-long",
            Template::RemLong => "rem-long",
            Template::IntToFloat => "int-to-float",
            Template::IntToDouble => "int-to-double",
            Template::LongToFloat => "long-to-float",
            Template::LongToDouble => "long-to-double",
            Template::FloatToInt => "float-to-int",
            Template::FloatToLong => "float-to-long",
            Template::FloatToDouble => "float-to-double",
            Template::DoubleToInt => "double-to-int",
            Template::DoubleToLong => "double-to-long",
            Template::DoubleToFloat => "double-to-float",
        }
    }

    /// `(source words, result words)`; sources are packed into consecutive argument registers.
    pub fn shape(self) -> (&'static [usize], usize) {
        use Template::*;
        match self {
            AddFloat | SubFloat | MulFloat | DivFloat | RemFloat | CmplFloat | CmpgFloat => {
                (&[1, 1], 1)
            }
            AddDouble | SubDouble | MulDouble | DivDouble | RemDouble => (&[2, 2], 2),
            CmplDouble | CmpgDouble | CmpLong => (&[2, 2], 1),
            MulLong | DivLong | RemLong => (&[2, 2], 2),
            ShlLong | ShrLong | UshrLong => (&[2, 1], 2),
            DivInt | RemInt => (&[1, 1], 1),
            IntToFloat | FloatToInt => (&[1], 1),
            IntToDouble | FloatToLong | FloatToDouble => (&[1], 2),
            LongToFloat | DoubleToInt | DoubleToFloat => (&[2], 1),
            LongToDouble | DoubleToLong => (&[2], 2),
        }
    }

    pub fn evaluate(self, args: [u32; 4]) -> Result<(u32, u32), DivideByZero> {
        use Template::*;
        let f = |index: usize| f32::from_bits(args[index]);
        let d = |index: usize| f64::from_bits(arith::join_long(args[index], args[index + 1]) as u64);
        let l = |index: usize| arith::join_long(args[index], args[index + 1]);
        let narrow = |value: u32| (value, 0);
        let wide = |value: i64| arith::split_long(value);
        let double = |value: f64| arith::split_long(value.to_bits() as i64);
        let result = match self {
            AddFloat => narrow((f(0) + f(1)).to_bits()),
            SubFloat => narrow((f(0) - f(1)).to_bits()),
            MulFloat => narrow((f(0) * f(1)).to_bits()),
            DivFloat => narrow((f(0) / f(1)).to_bits()),
            RemFloat => narrow(arith::rem_float(f(0), f(1)).to_bits()),
            AddDouble => double(d(0) + d(2)),
            SubDouble => double(d(0) - d(2)),
            MulDouble => double(d(0) * d(2)),
            DivDouble => double(d(0) / d(2)),
            RemDouble => double(arith::rem_double(d(0), d(2))),
            CmplFloat => narrow(arith::cmpl_float(f(0), f(1)) as u32),
            CmpgFloat => narrow(arith::cmpg_float(f(0), f(1)) as u32),
            CmplDouble => narrow(arith::cmpl_double(d(0), d(2)) as u32),
            CmpgDouble => narrow(arith::cmpg_double(d(0), d(2)) as u32),
            CmpLong => narrow(arith::cmp_long(l(0), l(2)) as u32),
            MulLong => wide(l(0).wrapping_mul(l(2))),
            ShlLong => wide(arith::shl_long(l(0), args[2] as i32)),
            ShrLong => wide(arith::shr_long(l(0), args[2] as i32)),
            UshrLong => wide(arith::ushr_long(l(0), args[2] as i32)),
            DivInt => narrow(arith::div_int(args[0] as i32, args[1] as i32).ok_or(DivideByZero)? as u32),
            RemInt => narrow(arith::rem_int(args[0] as i32, args[1] as i32).ok_or(DivideByZero)? as u32),
            DivLong => wide(arith::div_long(l(0), l(2)).ok_or(DivideByZero)?),
            RemLong => wide(arith::rem_long(l(0), l(2)).ok_or(DivideByZero)?),
            IntToFloat => narrow((args[0] as i32 as f32).to_bits()),
            IntToDouble => double(args[0] as i32 as f64),
            LongToFloat => narrow((l(0) as f32).to_bits()),
            LongToDouble => double(l(0) as f64),
            FloatToInt => narrow(arith::float_to_int(f(0)) as u32),
            FloatToLong => wide(arith::float_to_long(f(0))),
            FloatToDouble => double(f(0) as f64),
            DoubleToInt => narrow(arith::double_to_int(d(0)) as u32),
            DoubleToLong => wide(arith::double_to_long(d(0))),
            DoubleToFloat => narrow((d(0) as f32).to_bits()),
        };
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn addresses_round_trip_through_the_table() {
        for template in ALL {
            assert_eq!(Template::at(template.address()), Some(template));
        }
        assert_eq!(Template::at(TEMPLATE_BASE + 1), None);
    }

    #[test]
    fn long_multiply_uses_both_halves() {
        let (lo, hi) = Template::MulLong
            .evaluate([0x1_0000, 0, 0x1_0000, 0])
            .expect("no division");
        assert_eq!((lo, hi), (0, 1));
    }

    #[test]
    fn division_by_zero_is_reported() {
        assert_eq!(Template::DivInt.evaluate([1, 0, 0, 0]), Err(DivideByZero));
        let (quotient, _) = Template::DivInt
            .evaluate([i32::MIN as u32, -1i32 as u32, 0, 0])
            .expect("nonzero divisor");
        assert_eq!(quotient as i32, i32::MIN);
    }

    #[test]
    fn double_compare_reads_pairs() {
        let (a_lo, a_hi) = arith::split_long(1.5f64.to_bits() as i64);
        let (b_lo, b_hi) = arith::split_long(f64::NAN.to_bits() as i64);
        let (result, _) = Template::CmpgDouble
            .evaluate([a_lo, a_hi, b_lo, b_hi])
            .expect("compare");
        assert_eq!(result as i32, 1);
    }
}
