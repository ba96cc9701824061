//! Java arithmetic shared by the interpreter and the out-of-line templates.

pub fn div_int(a: i32, b: i32) -> Option<i32> {
    if b == 0 {
        return None;
    }
    Some(a.wrapping_div(b))
}

pub fn rem_int(a: i32, b: i32) -> Option<i32> {
    if b == 0 {
        return None;
    }
    Some(a.wrapping_rem(b))
}

pub fn div_long(a: i64, b: i64) -> Option<i64> {
    if b == 0 {
        return None;
    }
    Some(a.wrapping_div(b))
}

pub fn rem_long(a: i64, b: i64) -> Option<i64> {
    if b == 0 {
        return None;
    }
    Some(a.wrapping_rem(b))
}

pub fn shl_int(a: i32, distance: i32) -> i32 {
    a.wrapping_shl(distance as u32 & 31)
}

pub fn shr_int(a: i32, distance: i32) -> i32 {
    a.wrapping_shr(distance as u32 & 31)
}

pub fn ushr_int(a: i32, distance: i32) -> i32 {
    ((a as u32) >> (distance as u32 & 31)) as i32
}

pub fn shl_long(a: i64, distance: i32) -> i64 {
    a.wrapping_shl(distance as u32 & 63)
}

pub fn shr_long(a: i64, distance: i32) -> i64 {
    a.wrapping_shr(distance as u32 & 63)
}

pub fn ushr_long(a: i64, distance: i32) -> i64 {
    ((a as u64) >> (distance as u32 & 63)) as i64
}

/// `cmpl`: NaN compares as less.
pub fn cmpl_float(a: f32, b: f32) -> i32 {
    compare(a.partial_cmp(&b), -1)
}

/// `cmpg`: NaN compares as greater.
pub fn cmpg_float(a: f32, b: f32) -> i32 {
    compare(a.partial_cmp(&b), 1)
}

pub fn cmpl_double(a: f64, b: f64) -> i32 {
    compare(a.partial_cmp(&b), -1)
}

pub fn cmpg_double(a: f64, b: f64) -> i32 {
    compare(a.partial_cmp(&b), 1)
}

fn compare(ordering: Option<std::cmp::Ordering>, nan_bias: i32) -> i32 {
    match ordering {
        Some(std::cmp::Ordering::Less) => -1,
        Some(std::cmp::Ordering::Equal) => 0,
        Some(std::cmp::Ordering::Greater) => 1,
        None => nan_bias,
    }
}

pub fn cmp_long(a: i64, b: i64) -> i32 {
    match a.cmp(&b) {
        std::cmp::Ordering::Less => -1,
        std::cmp::Ordering::Equal => 0,
        std::cmp::Ordering::Greater => 1,
    }
}

// Rust float-to-int casts saturate and map NaN to zero, matching the VM.
pub fn float_to_int(value: f32) -> i32 {
    value as i32
}

pub fn float_to_long(value: f32) -> i64 {
    value as i64
}

pub fn double_to_int(value: f64) -> i32 {
    value as i32
}

pub fn double_to_long(value: f64) -> i64 {
    value as i64
}

pub fn rem_float(a: f32, b: f32) -> f32 {
    a % b
}

pub fn rem_double(a: f64, b: f64) -> f64 {
    a % b
}

pub fn int_to_byte(value: i32) -> i32 {
    value as i8 as i32
}

pub fn int_to_char(value: i32) -> i32 {
    value as u16 as i32
}

pub fn int_to_short(value: i32) -> i32 {
    value as i16 as i32
}

pub fn split_long(value: i64) -> (u32, u32) {
    (value as u32, (value as u64 >> 32) as u32)
}

pub fn join_long(lo: u32, hi: u32) -> i64 {
    ((hi as u64) << 32 | lo as u64) as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn min_int_division_wraps() {
        assert_eq!(div_int(i32::MIN, -1), Some(i32::MIN));
        assert_eq!(rem_int(i32::MIN, -1), Some(0));
        assert_eq!(div_long(i64::MIN, -1), Some(i64::MIN));
        assert_eq!(rem_long(i64::MIN, -1), Some(0));
        assert_eq!(div_int(1, 0), None);
    }

    #[test]
    fn float_conversions_saturate() {
        assert_eq!(float_to_int(f32::NAN), 0);
        assert_eq!(float_to_int(1e20), i32::MAX);
        assert_eq!(double_to_long(-1e300), i64::MIN);
        assert_eq!(double_to_int(-2.9), -2);
    }

    #[test]
    fn nan_bias_depends_on_the_compare_flavour() {
        assert_eq!(cmpl_float(f32::NAN, 1.0), -1);
        assert_eq!(cmpg_float(f32::NAN, 1.0), 1);
        assert_eq!(cmpl_double(2.0, 1.0), 1);
        assert_eq!(cmpg_double(1.0, 1.0), 0);
    }

    #[test]
    fn shift_distances_are_masked() {
        assert_eq!(shl_int(1, 33), 2);
        assert_eq!(ushr_int(-1, 28), 0xf);
        assert_eq!(shr_long(-8, 65), -4);
        assert_eq!(join_long(0xffff_ffff, 0), 0xffff_ffff);
        assert_eq!(split_long(-1), (u32::MAX, u32::MAX));
    }
}
