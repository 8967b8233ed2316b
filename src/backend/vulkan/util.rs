use std::ffi::{c_char, CStr, CString};

/// Copies a nul terminated C string into an owned string. Null pointers give an empty string.
pub(crate) unsafe fn wrap_c_str(s: *const c_char) -> String {
    if s.is_null() {
        String::default()
    } else {
        CStr::from_ptr(s).to_string_lossy().into_owned()
    }
}

pub(crate) fn unwrap_to_raw_strings(strings: &[CString]) -> Vec<*const c_char> {
    strings.iter().map(|string| string.as_ptr()).collect()
}

/// Round `size` up to a multiple of `alignment`, which must be a power of two.
pub(crate) const fn align_up(size: u64, alignment: u64) -> u64 {
    (size + alignment - 1) & !(alignment - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_up_rounds_to_power_of_two() {
        assert_eq!(align_up(0, 4), 0);
        assert_eq!(align_up(5, 4), 8);
        assert_eq!(align_up(32, 32), 32);
        assert_eq!(align_up(33, 64), 64);
    }
}
