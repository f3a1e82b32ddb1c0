//! C ABI for hosts that run inference themselves and only need the face box decoder.
//!
//! Handles are heap pointers owned by the caller between `init` and `release`. A handle
//! must not be released while another thread is inside `facevision_face_detect` with it.

use std::ptr;

use tracing::error;

use crate::face_detection::{face_detect, init_face_detector, DetectorHandle, FACE_STRIDE};

/// Returns a new detector handle, or null if the geometry is invalid.
#[no_mangle]
pub extern "C" fn facevision_init_face_detector(
    image_width: i32,
    image_height: i32,
    image_channels: i32,
) -> *mut DetectorHandle {
    if image_width <= 0 || image_height <= 0 || image_channels <= 0 {
        error!(image_width, image_height, image_channels, "invalid detector geometry");
        return ptr::null_mut();
    }

    match init_face_detector(image_width as u32, image_height as u32, image_channels as u32) {
        Ok(handle) => Box::into_raw(Box::new(handle)),
        Err(e) => {
            error!(error = %e, "failed to initialize face detector");
            ptr::null_mut()
        }
    }
}

/// Releases a handle returned by [`facevision_init_face_detector`]. Null is a no-op.
///
/// # Safety
///
/// `handle` must be null or a pointer obtained from `facevision_init_face_detector`
/// that has not been released yet. No `facevision_face_detect` call may be running on it.
#[no_mangle]
pub unsafe extern "C" fn facevision_release_face_detector(handle: *mut DetectorHandle) {
    if handle.is_null() {
        return;
    }
    drop(Box::from_raw(handle));
}

/// Decodes raw detector outputs.
///
/// On success writes a newly allocated stride-5 array to `out` and its length in floats
/// to `out_len`, and returns the number of detected faces. The array must be freed with
/// [`facevision_free_result`]. Returns -1 on any error, leaving the out parameters untouched.
///
/// # Safety
///
/// `handle` must be a live handle; `scores` and `boxes` must point to `scores_len` and
/// `boxes_len` readable floats; `out` and `out_len` must be writable.
#[no_mangle]
pub unsafe extern "C" fn facevision_face_detect(
    handle: *const DetectorHandle,
    scores: *const f32,
    scores_len: usize,
    boxes: *const f32,
    boxes_len: usize,
    out: *mut *mut f32,
    out_len: *mut usize,
) -> i32 {
    if handle.is_null() || scores.is_null() || boxes.is_null() || out.is_null() || out_len.is_null() {
        return -1;
    }

    let handle = &*handle;
    let scores = std::slice::from_raw_parts(scores, scores_len);
    let boxes = std::slice::from_raw_parts(boxes, boxes_len);

    match face_detect(handle, scores, boxes) {
        Ok(result) => {
            let len = result.len();
            let faces = (len / FACE_STRIDE) as i32;
            *out = Box::into_raw(result.into_boxed_slice()) as *mut f32;
            *out_len = len;
            faces
        }
        Err(e) => {
            error!(error = %e, "face detection failed");
            -1
        }
    }
}

/// Frees an array returned through `out` by [`facevision_face_detect`]. Null is a no-op.
///
/// # Safety
///
/// `data` and `len` must be exactly the values written by `facevision_face_detect`.
#[no_mangle]
pub unsafe extern "C" fn facevision_free_result(data: *mut f32, len: usize) {
    if data.is_null() {
        return;
    }
    drop(Box::from_raw(ptr::slice_from_raw_parts_mut(data, len)));
}
