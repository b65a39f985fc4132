//! Beacon compatibility layer.
//!
//! The callback functions a BOF links against instead of the C runtime:
//! output, argument parsing, format buffers and a few utility and memory
//! wrappers. The loader hands their addresses out through [`BeaconApi`],
//! an explicitly constructed table rather than hidden global state. All
//! output funnels into the thread-local accumulator in [`crate::output`].

#![cfg(target_os = "windows")]

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::collections::HashMap;
use std::ffi::CStr;
use std::os::raw::{c_char, c_int, c_short};
use std::ptr::{self, null_mut};

use winapi::ctypes::c_void;
use winapi::um::memoryapi::{VirtualAlloc, VirtualFree, VirtualProtect};

use crate::output;

// Callback types carrying text; anything else gets hex-dumped.
const CALLBACK_OUTPUT: c_int = 0x00;
const CALLBACK_ERROR: c_int = 0x0d;
const CALLBACK_OUTPUT_OEM: c_int = 0x1e;
const CALLBACK_OUTPUT_UTF8: c_int = 0x20;

/// Beacon's argument parser state, layout-compatible with beacon.h.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Data {
    original: *mut c_char,
    buffer: *mut c_char,
    length: c_int,
    size: c_int,
}

/// Beacon's output formatter state, layout-compatible with beacon.h.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Format {
    original: *mut c_char,
    buffer: *mut c_char,
    length: c_int,
    size: c_int,
}

/// The table of Beacon API symbols the resolver binds BOF imports
/// against. Built once per loader instance; addresses are process-wide
/// function pointers, safe for concurrent reads.
pub struct BeaconApi {
    entries: HashMap<&'static str, usize>,
}

impl BeaconApi {
    pub fn new() -> Self {
        let mut entries: HashMap<&'static str, usize> = HashMap::new();

        // Output
        entries.insert("BeaconPrintf", beacon_printf as usize);
        entries.insert("BeaconOutput", beacon_output as usize);
        entries.insert("BeaconGetOutputData", beacon_get_output_data as usize);

        // Argument parsing
        entries.insert("BeaconDataParse", beacon_data_parse as usize);
        entries.insert("BeaconDataInt", beacon_data_int as usize);
        entries.insert("BeaconDataShort", beacon_data_short as usize);
        entries.insert("BeaconDataLength", beacon_data_length as usize);
        entries.insert("BeaconDataExtract", beacon_data_extract as usize);
        entries.insert("BeaconDataPtr", beacon_data_ptr as usize);

        // Format buffers
        entries.insert("BeaconFormatAlloc", beacon_format_alloc as usize);
        entries.insert("BeaconFormatReset", beacon_format_reset as usize);
        entries.insert("BeaconFormatFree", beacon_format_free as usize);
        entries.insert("BeaconFormatAppend", beacon_format_append as usize);
        entries.insert("BeaconFormatPrintf", beacon_format_printf as usize);
        entries.insert("BeaconFormatInt", beacon_format_int as usize);
        entries.insert("BeaconFormatToString", beacon_format_to_string as usize);

        // Utility
        entries.insert("toWideChar", to_wide_char as usize);

        // Memory wrappers
        entries.insert("BeaconVirtualAlloc", beacon_virtual_alloc as usize);
        entries.insert("BeaconVirtualProtect", beacon_virtual_protect as usize);
        entries.insert("BeaconVirtualFree", beacon_virtual_free as usize);

        Self { entries }
    }

    /// Address of a Beacon API function, if `name` is one.
    pub fn resolve(&self, name: &str) -> Option<usize> {
        self.entries.get(name).copied()
    }
}

impl Default for BeaconApi {
    fn default() -> Self {
        Self::new()
    }
}

unsafe extern "C" fn beacon_printf(_type: c_int, fmt: *mut c_char, mut args: ...) {
    if fmt.is_null() {
        return;
    }
    let mut text = String::new();
    printf_compat::format(fmt, args.as_va_list(), printf_compat::output::fmt_write(&mut text));
    output::append_str(&text);
}

unsafe extern "C" fn beacon_output(type_: c_int, data: *mut c_char, len: c_int) {
    if data.is_null() || len <= 0 {
        return;
    }
    let bytes = std::slice::from_raw_parts(data as *const u8, len as usize);
    match type_ {
        CALLBACK_OUTPUT | CALLBACK_ERROR | CALLBACK_OUTPUT_OEM | CALLBACK_OUTPUT_UTF8 => {
            output::append_bytes(bytes)
        }
        _ => output::append_hex_dump(bytes),
    }
}

thread_local! {
    // Keeps the last snapshot handed to a BOF alive until the next call.
    static OUTPUT_SNAPSHOT: std::cell::RefCell<Vec<u8>> = const { std::cell::RefCell::new(Vec::new()) };
}

unsafe extern "C" fn beacon_get_output_data(outsize: *mut c_int) -> *mut c_char {
    OUTPUT_SNAPSHOT.with(|snap| {
        let mut snap = snap.borrow_mut();
        *snap = output::take();
        if !outsize.is_null() {
            *outsize = snap.len() as c_int;
        }
        snap.as_mut_ptr() as *mut c_char
    })
}

unsafe extern "C" fn beacon_data_parse(data: *mut Data, buffer: *mut c_char, size: c_int) {
    if data.is_null() {
        return;
    }
    // the leading 4 bytes are the total-length prefix
    (*data).original = buffer;
    (*data).buffer = if buffer.is_null() { buffer } else { buffer.add(4) };
    (*data).length = size - 4;
    (*data).size = size - 4;
}

unsafe extern "C" fn beacon_data_int(data: *mut Data) -> c_int {
    if data.is_null() || (*data).buffer.is_null() || (*data).length < 4 {
        return 0;
    }
    let value = ptr::read_unaligned((*data).buffer as *const i32);
    (*data).buffer = (*data).buffer.add(4);
    (*data).length -= 4;
    value
}

unsafe extern "C" fn beacon_data_short(data: *mut Data) -> c_short {
    if data.is_null() || (*data).buffer.is_null() || (*data).length < 2 {
        return 0;
    }
    let value = ptr::read_unaligned((*data).buffer as *const i16);
    (*data).buffer = (*data).buffer.add(2);
    (*data).length -= 2;
    value
}

unsafe extern "C" fn beacon_data_length(data: *const Data) -> c_int {
    if data.is_null() {
        return 0;
    }
    (*data).length
}

unsafe extern "C" fn beacon_data_extract(data: *mut Data, size: *mut c_int) -> *mut c_char {
    if data.is_null() || (*data).buffer.is_null() || (*data).length < 4 {
        return null_mut();
    }
    let len = ptr::read_unaligned((*data).buffer as *const u32) as c_int;
    if len < 0 || (*data).length - 4 < len {
        return null_mut();
    }
    let out = (*data).buffer.add(4);
    (*data).buffer = (*data).buffer.add(4 + len as usize);
    (*data).length -= 4 + len;
    if !size.is_null() {
        *size = len;
    }
    out
}

unsafe extern "C" fn beacon_data_ptr(data: *mut Data, size: c_int) -> *mut c_char {
    if data.is_null() || (*data).buffer.is_null() || size <= 0 || (*data).length < size {
        return null_mut();
    }
    let out = (*data).buffer;
    (*data).buffer = (*data).buffer.add(size as usize);
    (*data).length -= size;
    out
}

unsafe extern "C" fn beacon_format_alloc(format: *mut Format, max: c_int) {
    if format.is_null() || max <= 0 {
        return;
    }
    if let Ok(layout) = Layout::from_size_align(max as usize, 1) {
        let original = alloc_zeroed(layout) as *mut c_char;
        (*format).original = original;
        (*format).buffer = original;
        (*format).length = 0;
        (*format).size = max;
    }
}

unsafe extern "C" fn beacon_format_reset(format: *mut Format) {
    if format.is_null() || (*format).original.is_null() {
        return;
    }
    ptr::write_bytes((*format).original, 0, (*format).size as usize);
    (*format).buffer = (*format).original;
    (*format).length = 0;
}

unsafe extern "C" fn beacon_format_free(format: *mut Format) {
    if format.is_null() {
        return;
    }
    if !(*format).original.is_null() {
        if let Ok(layout) = Layout::from_size_align((*format).size as usize, 1) {
            dealloc((*format).original as *mut u8, layout);
        }
        (*format).original = null_mut();
    }
    (*format).buffer = null_mut();
    (*format).length = 0;
    (*format).size = 0;
}

unsafe extern "C" fn beacon_format_append(format: *mut Format, text: *const c_char, len: c_int) {
    if format.is_null() || text.is_null() || len <= 0 {
        return;
    }
    if (*format).length + len > (*format).size {
        return;
    }
    ptr::copy_nonoverlapping(text, (*format).buffer, len as usize);
    (*format).buffer = (*format).buffer.add(len as usize);
    (*format).length += len;
}

unsafe extern "C" fn beacon_format_printf(format: *mut Format, fmt: *mut c_char, mut args: ...) {
    if format.is_null() || fmt.is_null() {
        return;
    }
    let mut text = String::new();
    printf_compat::format(fmt, args.as_va_list(), printf_compat::output::fmt_write(&mut text));
    if (*format).length + text.len() as c_int >= (*format).size {
        return;
    }
    ptr::copy_nonoverlapping(
        text.as_ptr() as *const c_char,
        (*format).buffer,
        text.len(),
    );
    (*format).buffer = (*format).buffer.add(text.len());
    (*format).length += text.len() as c_int;
}

/// Appends a big-endian integer, matching Beacon's on-wire convention.
unsafe extern "C" fn beacon_format_int(format: *mut Format, value: c_int) {
    if format.is_null() || (*format).length + 4 > (*format).size {
        return;
    }
    let bytes = (value as u32).to_be_bytes();
    ptr::copy_nonoverlapping(bytes.as_ptr() as *const c_char, (*format).buffer, 4);
    (*format).buffer = (*format).buffer.add(4);
    (*format).length += 4;
}

unsafe extern "C" fn beacon_format_to_string(format: *mut Format, size: *mut c_int) -> *mut c_char {
    if format.is_null() {
        return null_mut();
    }
    if !size.is_null() {
        *size = (*format).length;
    }
    (*format).original
}

unsafe extern "C" fn to_wide_char(src: *const c_char, dst: *mut u16, max: c_int) -> c_int {
    if src.is_null() || dst.is_null() || max < 2 {
        return 0;
    }
    let Ok(text) = CStr::from_ptr(src).to_str() else {
        return 0;
    };
    let wide: Vec<u16> = text.encode_utf16().collect();
    let capacity = max as usize / 2;
    if wide.len() >= capacity {
        return 0;
    }
    let out = std::slice::from_raw_parts_mut(dst, capacity);
    out[..wide.len()].copy_from_slice(&wide);
    out[wide.len()] = 0;
    1
}

unsafe extern "C" fn beacon_virtual_alloc(
    address: *mut c_void,
    size: usize,
    alloc_type: u32,
    protect: u32,
) -> *mut c_void {
    VirtualAlloc(address, size, alloc_type, protect)
}

unsafe extern "C" fn beacon_virtual_protect(
    address: *mut c_void,
    size: usize,
    new_protect: u32,
    old_protect: *mut u32,
) -> c_int {
    VirtualProtect(address, size, new_protect, old_protect)
}

unsafe extern "C" fn beacon_virtual_free(address: *mut c_void, size: usize, free_type: u32) -> c_int {
    VirtualFree(address, size, free_type)
}
