//! Small helpers shared by the interpreter and the JIT.

/// Returns a `Box<[T; LEN]>` filled with `elem`.
#[inline(always)]
pub fn boxed_array<T: Clone, const LEN: usize>(elem: T) -> Box<[T; LEN]> {
    vec![elem; LEN].into_boxed_slice().try_into().ok().unwrap()
}

/// Sign extends the low `BITS` bits of `value`.
#[inline(always)]
pub const fn sign_extend<const BITS: u32>(value: i32) -> i32 {
    const { assert!(BITS > 0 && BITS <= 32) };
    (value << (32 - BITS)) >> (32 - BITS)
}

/// Clamps `value` to the signed 24 bit range.
#[inline(always)]
pub const fn saturate24(value: i32) -> i32 {
    if value > 0x7F_FFFF {
        0x7F_FFFF
    } else if value < -0x80_0000 {
        -0x80_0000
    } else {
        value
    }
}

/// Like offset_of, except it also supports indexing arrays
#[macro_export]
macro_rules! offset_of {
    ($t:ty, $($path:tt)+) => {{
        const OFFSET: usize = {
            let data = core::mem::MaybeUninit::<$t>::uninit();
            let ptr = data.as_ptr();
            unsafe { (&raw const (*ptr).$($path)+).byte_offset_from(ptr) as usize }
        };

        OFFSET
    }}
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn sign_extension() {
        assert_eq!(sign_extend::<8>(0x7F), 0x7F);
        assert_eq!(sign_extend::<8>(0x80), -0x80);
        assert_eq!(sign_extend::<24>(0x00FF_FFFF), -1);
        assert_eq!(sign_extend::<30>(0x2000_0000), -0x2000_0000);
        assert_eq!(sign_extend::<32>(-5), -5);
    }

    #[test]
    fn saturation() {
        assert_eq!(saturate24(0x0100_0000), 0x7F_FFFF);
        assert_eq!(saturate24(-0x0100_0000), -0x80_0000);
        assert_eq!(saturate24(0x1234), 0x1234);
    }

    #[test]
    fn offsets() {
        #[repr(C)]
        struct Inner {
            a: u32,
            b: [i32; 4],
        }

        assert_eq!(offset_of!(Inner, b[2]), 12);
    }
}
