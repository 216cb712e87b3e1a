use std::mem;
use std::ptr;

use libc::c_char;

use crate::log::LogBits;
use crate::proc::Proc;
use crate::runtime::Runtime;

/// Guest string value: header followed by `alloc` payload bytes, of
/// which `fill` are meaningful. Vectors share the same header shape.
#[repr(C)]
#[derive(Debug)]
pub struct Str {
    pub refcnt: usize,
    pub alloc: usize,
    pub fill: usize,
}

#[repr(C)]
#[derive(Debug)]
pub struct Vector {
    pub refcnt: usize,
    pub alloc: usize,
    pub fill: usize,
}

/// Smallest power of two >= `n`, for `n >= 1`.
pub fn next_power_of_two(n: usize) -> usize {
    let mut tmp = n.wrapping_sub(1);
    tmp |= tmp >> 1;
    tmp |= tmp >> 2;
    tmp |= tmp >> 4;
    tmp |= tmp >> 8;
    tmp |= tmp >> 16;
    #[cfg(target_pointer_width = "64")]
    {
        tmp |= tmp >> 32;
    }
    tmp.wrapping_add(1)
}

/// # Safety
///
/// `s` must point at a live string value.
pub unsafe fn str_data(s: *const Str) -> *mut u8 {
    s.add(1) as *mut u8
}

/// # Safety
///
/// `s` must point at a live string value with `fill` readable payload
/// bytes.
pub unsafe fn str_bytes<'a>(s: *const Str) -> &'a [u8] {
    std::slice::from_raw_parts(str_data(s), (*s).fill)
}

/// # Safety
///
/// `v` must point at a live vector value.
pub unsafe fn vec_data(v: *const Vector) -> *mut u8 {
    v.add(1) as *mut u8
}

impl Runtime {
    /// Allocate a string value of `fill` bytes, copying from `bytes`
    /// when it is non-null. Capacity is the next power of two of the
    /// requested fill.
    pub fn new_str(&mut self, bytes: *const u8, fill: usize) -> *mut Str {
        let alloc = next_power_of_two(fill);
        let s = self.alloc(mem::size_of::<Str>() + alloc) as *mut Str;
        unsafe {
            (*s).refcnt = 1;
            (*s).alloc = alloc;
            (*s).fill = fill;
            if !bytes.is_null() {
                ptr::copy_nonoverlapping(bytes, str_data(s), fill);
            }
        }
        self.log(LogBits::UPCALL | LogBits::MEM, || {
            format!("new_str({} bytes) -> {:#x}", fill, s as usize)
        });
        s
    }
}

/// Payload pointer of a string value, for compiled code that needs a C
/// string view.
///
/// # Safety
///
/// `s` must point at a live string value.
#[no_mangle]
pub unsafe extern "C" fn str_buf(_proc: *mut Proc, s: *mut Str) -> *const c_char {
    str_data(s) as *const c_char
}

/// Implode a vector of u32 unichars into a byte string.
///
/// # Safety
///
/// `p` must be a live proc of a running runtime and `v` a live vector
/// value of u32 elements.
// TODO: emit proper UTF-8 instead of truncating each unichar to a byte.
#[no_mangle]
pub unsafe extern "C" fn implode(p: *mut Proc, v: *mut Vector) -> *mut Str {
    let fill = (*v).fill >> 2;
    let rt = (*p).rt;
    let s = (*rt).new_str(ptr::null(), fill);

    let src = vec_data(v) as *const u32;
    let dst = str_data(s);
    for i in 0..fill {
        *dst.add(i) = *src.add(i) as u8;
    }
    s
}
