//! C ABI over [`edgepred_core::PredictionContext`].
//!
//! Handles are opaque heap pointers created by [`edgepred_create`] and
//! released by [`edgepred_destroy`]. Accessors given a null handle return
//! zero or null. Panics never cross the boundary.

use std::ffi::{c_char, CStr};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::OnceLock;

use edgepred_core::logging::init_library_logging;
use edgepred_core::runtime::{log_runtime_lib_status, setup_runtime_libs, RuntimeLibStatus};
use edgepred_core::{resize_float, resize_to_i8, resize_to_u8, ImageShape, PredictionContext};
use tracing::error;

pub const EDGEPRED_OK: i32 = 0;
pub const EDGEPRED_ERR_NULL: i32 = -1;
pub const EDGEPRED_ERR_FAILED: i32 = -2;
pub const EDGEPRED_ERR_PANIC: i32 = -3;

/// Opaque prediction handle.
pub struct EdgepredContext {
    inner: PredictionContext,
}

unsafe fn slice_or_empty<'a, T>(data: *const T, len: usize) -> &'a [T] {
    if data.is_null() || len == 0 {
        &[]
    } else {
        // SAFETY: caller guarantees `data` points at `len` readable elements.
        unsafe { std::slice::from_raw_parts(data, len) }
    }
}

unsafe fn context_ref<'a>(handle: *const EdgepredContext) -> Option<&'a EdgepredContext> {
    // SAFETY: non-null handles come from `edgepred_create`.
    unsafe { handle.as_ref() }
}

static RUNTIME_LIBS: OnceLock<RuntimeLibStatus> = OnceLock::new();
static RUNTIME_SETUP_RUNS: AtomicUsize = AtomicUsize::new(0);

/// Locate the bundled runtime libraries on first use.
fn ensure_runtime_libs() -> &'static RuntimeLibStatus {
    RUNTIME_LIBS.get_or_init(|| {
        RUNTIME_SETUP_RUNS.fetch_add(1, Ordering::Relaxed);
        let status = setup_runtime_libs();
        log_runtime_lib_status(&status);
        status
    })
}

fn guarded(op: &str, f: impl FnOnce() -> i32) -> i32 {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(status) => status,
        Err(_) => {
            error!(op, "Panic caught at the C boundary");
            EDGEPRED_ERR_PANIC
        }
    }
}

/// Load a model. Returns null on any failure.
///
/// # Safety
/// `model_path` must be null or a NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn edgepred_create(
    model_path: *const c_char,
    batch: i64,
    mode: i32,
    verbose: bool,
    profile: bool,
) -> *mut EdgepredContext {
    if verbose {
        init_library_logging(true);
    }
    ensure_runtime_libs();
    if model_path.is_null() {
        return ptr::null_mut();
    }
    // SAFETY: checked non-null; caller guarantees NUL termination.
    let path = PathBuf::from(unsafe { CStr::from_ptr(model_path) }.to_string_lossy().into_owned());

    let created = catch_unwind(AssertUnwindSafe(|| {
        PredictionContext::create(&path, batch, mode, verbose, profile)
    }));
    match created {
        Ok(Ok(inner)) => Box::into_raw(Box::new(EdgepredContext { inner })),
        Ok(Err(e)) => {
            error!(path = %path.display(), error = %e, "Failed to create prediction context");
            ptr::null_mut()
        }
        Err(_) => {
            error!(path = %path.display(), "Panic while creating prediction context");
            ptr::null_mut()
        }
    }
}

/// Run one prediction. Zero source dimensions mean the model's own.
///
/// # Safety
/// `handle` must be null or live; each data pointer must be null or point at
/// its stated number of elements.
#[no_mangle]
pub unsafe extern "C" fn edgepred_predict(
    handle: *mut EdgepredContext,
    quantized: *const i32,
    quantized_len: usize,
    floats: *const f32,
    floats_len: usize,
    use_quantized: bool,
    height: usize,
    width: usize,
    channels: usize,
) -> i32 {
    // SAFETY: see function contract.
    let Some(ctx) = (unsafe { handle.as_mut() }) else {
        return EDGEPRED_ERR_NULL;
    };
    let quantized = unsafe { slice_or_empty(quantized, quantized_len) };
    let floats = unsafe { slice_or_empty(floats, floats_len) };

    guarded("predict", || {
        match ctx
            .inner
            .predict_with_shape(quantized, floats, use_quantized, height, width, channels)
        {
            Ok(()) => EDGEPRED_OK,
            Err(e) => {
                error!(error = %e, "Prediction failed");
                EDGEPRED_ERR_FAILED
            }
        }
    })
}

/// Last prediction, `edgepred_get_output_length` floats long; null before
/// the first successful predict.
///
/// # Safety
/// `handle` must be null or live. The pointer is valid until the next
/// predict or destroy.
#[no_mangle]
pub unsafe extern "C" fn edgepred_get_predictions(handle: *const EdgepredContext) -> *const f32 {
    unsafe { context_ref(handle) }
        .and_then(|ctx| ctx.inner.predictions())
        .map_or(ptr::null(), <[f32]>::as_ptr)
}

/// # Safety
/// `handle` must be null or live.
#[no_mangle]
pub unsafe extern "C" fn edgepred_get_width(handle: *const EdgepredContext) -> usize {
    unsafe { context_ref(handle) }.map_or(0, |ctx| ctx.inner.width())
}

/// # Safety
/// `handle` must be null or live.
#[no_mangle]
pub unsafe extern "C" fn edgepred_get_height(handle: *const EdgepredContext) -> usize {
    unsafe { context_ref(handle) }.map_or(0, |ctx| ctx.inner.height())
}

/// # Safety
/// `handle` must be null or live.
#[no_mangle]
pub unsafe extern "C" fn edgepred_get_channels(handle: *const EdgepredContext) -> usize {
    unsafe { context_ref(handle) }.map_or(0, |ctx| ctx.inner.channels())
}

/// # Safety
/// `handle` must be null or live.
#[no_mangle]
pub unsafe extern "C" fn edgepred_get_output_length(handle: *const EdgepredContext) -> usize {
    unsafe { context_ref(handle) }.map_or(0, |ctx| ctx.inner.output_length())
}

/// Release a handle. Null is a no-op.
///
/// # Safety
/// `handle` must be null or live, and is dangling afterwards.
#[no_mangle]
pub unsafe extern "C" fn edgepred_destroy(handle: *mut EdgepredContext) {
    if handle.is_null() {
        return;
    }
    // SAFETY: produced by `Box::into_raw` in `edgepred_create`.
    drop(unsafe { Box::from_raw(handle) });
}

unsafe fn resize_into<S, T>(
    op: &str,
    src: *const S,
    from: ImageShape,
    dst: *mut T,
    to: ImageShape,
    resize: impl FnOnce(&[S], ImageShape, &mut [T], ImageShape) -> edgepred_core::Result<()>,
) -> i32 {
    if src.is_null() || dst.is_null() {
        return EDGEPRED_ERR_NULL;
    }
    let (Some(src_len), Some(dst_len)) = (from.checked_len(), to.checked_len()) else {
        error!(op, from = ?from, to = ?to, "Image shape overflows usize");
        return EDGEPRED_ERR_FAILED;
    };
    // SAFETY: caller guarantees both buffers match their shapes.
    let src = unsafe { std::slice::from_raw_parts(src, src_len) };
    let dst = unsafe { std::slice::from_raw_parts_mut(dst, dst_len) };
    guarded(op, || match resize(src, from, dst, to) {
        Ok(()) => EDGEPRED_OK,
        Err(e) => {
            error!(op, error = %e, "Resize failed");
            EDGEPRED_ERR_FAILED
        }
    })
}

/// Bilinear resize of an HWC f32 image into `dst`.
///
/// # Safety
/// `src` must hold `src_h * src_w * src_c` floats and `dst` room for
/// `dst_h * dst_w * dst_c`.
#[no_mangle]
pub unsafe extern "C" fn edgepred_resize_float(
    src: *const f32,
    src_h: usize,
    src_w: usize,
    src_c: usize,
    dst: *mut f32,
    dst_h: usize,
    dst_w: usize,
    dst_c: usize,
) -> i32 {
    let from = ImageShape::new(src_h, src_w, src_c);
    let to = ImageShape::new(dst_h, dst_w, dst_c);
    unsafe { resize_into("resize_float", src, from, dst, to, resize_float) }
}

/// Resize quantized pixel values, truncating into u8.
///
/// # Safety
/// See [`edgepred_resize_float`]; `src` holds i32 values.
#[no_mangle]
pub unsafe extern "C" fn edgepred_resize_to_u8(
    src: *const i32,
    src_h: usize,
    src_w: usize,
    src_c: usize,
    dst: *mut u8,
    dst_h: usize,
    dst_w: usize,
    dst_c: usize,
) -> i32 {
    let from = ImageShape::new(src_h, src_w, src_c);
    let to = ImageShape::new(dst_h, dst_w, dst_c);
    unsafe { resize_into("resize_to_u8", src, from, dst, to, resize_to_u8) }
}

/// Like [`edgepred_resize_to_u8`], truncating into i8.
///
/// # Safety
/// See [`edgepred_resize_to_u8`].
#[no_mangle]
pub unsafe extern "C" fn edgepred_resize_to_i8(
    src: *const i32,
    src_h: usize,
    src_w: usize,
    src_c: usize,
    dst: *mut i8,
    dst_h: usize,
    dst_w: usize,
    dst_c: usize,
) -> i32 {
    let from = ImageShape::new(src_h, src_w, src_c);
    let to = ImageShape::new(dst_h, dst_w, dst_c);
    unsafe { resize_into("resize_to_i8", src, from, dst, to, resize_to_i8) }
}
