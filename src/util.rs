// MISCELLANEOUS HELPERS
//
// Small, dependency-free-ish utility functions shared by packet, link and
// engine.
//
//   fill(dst, len, val) - memset a byte slice
//   copy(dst, src, len) - memcpy between byte slices
//   align(value, size) - round value up to a multiple of size
//   comma_value(n) -> String - format a u64 with thousands separators
//   random_bytes(dst, n) - fill a slice with n random bytes

use std::cmp;
use std::ptr;
use regex::Regex;
use once_cell::sync::Lazy;
use core::ffi;

pub fn fill(dst: &mut [u8], len: usize, val: u8) {
    unsafe {
        ptr::write_bytes(dst.as_mut_ptr(), val, cmp::min(len, dst.len()));
    }
}

pub fn copy(dst: &mut [u8], src: &[u8], len: usize) {
    unsafe {
        ptr::copy(src.as_ptr(), dst.as_mut_ptr(),
                  cmp::min(len, cmp::min(src.len(), dst.len())));
    }
}

// Increase value to be a multiple of size (if it is not already).
pub fn align(value: usize, size: usize) -> usize {
   if value % size == 0 {
       value
   } else {
       value + size - (value % size)
   }
}

pub fn comma_value(n: u64) -> String { // credit http://richard.warburton.it
    let s = format!("{}", n);
    if let Some(cap) = CVLEFTNUM.captures(&s) {
        let (left, num) = (&cap[1], &cap[2]);
        let rev = |s: &str| { s.chars().rev().collect::<String>() };
        let num = rev(&CVTHOUSANDS.replace_all(&rev(&num), "$1,").to_string());
        format!("{}{}", left, num)
    } else { s }
}
static CVLEFTNUM: Lazy<Regex> = Lazy::new
    (|| Regex::new(r"^(\d\d?\d?)(\d{3}*)$").unwrap());
static CVTHOUSANDS: Lazy<Regex> = Lazy::new
    (|| Regex::new(r"(\d{3})").unwrap());

// Fill slice with n random bytes.
pub fn random_bytes(dst: &mut [u8], n: usize) {
    let n = cmp::min(n, dst.len());
    if unsafe {
        libc::getrandom(dst.as_mut_ptr() as *mut ffi::c_void, n, 0)
    } != n as isize { panic!("getrandom(2) failed"); }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_rounds_up() {
        assert_eq!(align(0, 8), 0);
        assert_eq!(align(1, 8), 8);
        assert_eq!(align(8, 8), 8);
        assert_eq!(align(9, 8), 16);
    }

    #[test]
    fn comma_value_formats_thousands() {
        assert_eq!(comma_value(0), "0");
        assert_eq!(comma_value(999), "999");
        assert_eq!(comma_value(1000), "1,000");
        assert_eq!(comma_value(1_234_567), "1,234,567");
    }

    #[test]
    fn fill_and_copy_respect_bounds() {
        let mut dst = [0u8; 4];
        fill(&mut dst, 10, 7); // len exceeds dst: should clamp, not overflow
        assert_eq!(dst, [7, 7, 7, 7]);
        let src = [1u8, 2, 3];
        let mut out = [0u8; 2];
        copy(&mut out, &src, 3); // len exceeds out: should clamp
        assert_eq!(out, [1, 2]);
    }
}
