/* SPDX-License-Identifier: GPL-3.0-or-later */
/*! Preloaded entry points for OpenGL capture.
 *
 * Applications either link these names directly or look them up with
 * `dlsym`/`*GetProcAddress`; both routes end in `vkcapture::glinject`. */
#![allow(non_snake_case)]
#![allow(clippy::missing_safety_doc)]

use std::ffi::{c_char, c_uint, c_ulong, c_void};
use vkcapture::glinject;

#[no_mangle]
pub unsafe extern "C" fn eglGetProcAddress(name: *const c_char) -> *mut c_void {
    glinject::egl_get_proc_address(name)
}

#[no_mangle]
pub unsafe extern "C" fn eglSwapBuffers(display: *mut c_void, surface: *mut c_void) -> c_uint {
    glinject::egl_swap_buffers(display, surface)
}

#[no_mangle]
pub unsafe extern "C" fn eglDestroyContext(display: *mut c_void, context: *mut c_void) -> c_uint {
    glinject::egl_destroy_context(display, context)
}

#[no_mangle]
pub unsafe extern "C" fn eglCreateWindowSurface(
    display: *mut c_void,
    config: *mut c_void,
    window: *mut c_void,
    attribs: *const i32,
) -> *mut c_void {
    glinject::egl_create_window_surface(display, config, window, attribs)
}

#[no_mangle]
pub unsafe extern "C" fn glXGetProcAddress(name: *const c_char) -> *mut c_void {
    glinject::glx_get_proc_address(name)
}

#[no_mangle]
pub unsafe extern "C" fn glXGetProcAddressARB(name: *const c_char) -> *mut c_void {
    glinject::glx_get_proc_address_arb(name)
}

#[no_mangle]
pub unsafe extern "C" fn glXSwapBuffers(display: *mut c_void, drawable: c_ulong) {
    glinject::glx_swap_buffers(display, drawable)
}

#[no_mangle]
pub unsafe extern "C" fn glXSwapBuffersMscOML(
    display: *mut c_void,
    drawable: c_ulong,
    target_msc: i64,
    divisor: i64,
    remainder: i64,
) -> i64 {
    glinject::glx_swap_buffers_msc_oml(display, drawable, target_msc, divisor, remainder)
}

#[no_mangle]
pub unsafe extern "C" fn glXDestroyContext(display: *mut c_void, context: *mut c_void) {
    glinject::glx_destroy_context(display, context)
}

#[no_mangle]
pub unsafe extern "C" fn dlsym(handle: *mut c_void, name: *const c_char) -> *mut c_void {
    glinject::dlsym_hook(handle, name)
}

#[no_mangle]
pub unsafe extern "C" fn dlvsym(
    handle: *mut c_void,
    name: *const c_char,
    version: *const c_char,
) -> *mut c_void {
    glinject::dlvsym_hook(handle, name, version)
}
