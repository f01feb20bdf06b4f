#![forbid(unsafe_code)]
//! Synchronous and asynchronous image I/O.
//!
//! The adaptation layer between blocking callers and the asynchronous
//! dispatch pipeline. Every operation comes in two shapes:
//!
//! - a blocking form (`read`, `write`, `discard`, `write_same`,
//!   `compare_and_write`, `flush`) that creates a completion/waiter pair,
//!   invokes the asynchronous form, and blocks until the pipeline resolves
//!   the completion;
//! - an asynchronous form (`aio_*`) taking a caller-supplied completion and
//!   a `native_async` flag that arms external event notification when the
//!   image's event channel is active.
//!
//! Each `aio_*` stamps the completion (kind + start time) before anything
//! else, gates on image readiness (no backing store fails the completion
//! with `NoDevice` and never builds a request), then builds and submits the
//! per-kind dispatch request at [`DispatchLayer::ApiStart`].
//!
//! Extent policy: write, discard, write-same, and compare-and-write extents
//! are clipped by [`clip_io`] *before* the completion is constructed — an
//! offset at or past the end of the image fails with `InvalidExtent` and no
//! completion ever exists. Read extents are deliberately NOT clipped here;
//! the pipeline clips them at execution time. Downstream behavior depends on
//! this asymmetry, so keep it.
//!
//! On success the data-moving blocking forms return the clipped length, not
//! the originally requested length (`write(off=900, len=200)` on a
//! 1000-byte image returns 100).

use std::sync::Arc;
use tracing::Span;
use vbd_completion::Completion;
use vbd_dispatch::ImageDispatchSpec;
use vbd_error::{Result, VbdError};
use vbd_image::ImageCtx;
use vbd_types::{DispatchLayer, FlushSource, ImageExtent, IoKind, MismatchSlot, OpFlags, ReadResult};

/// Clamp `len` so `[off, off + len)` stays within the image.
///
/// Reads the image size under its shared lock for the comparison only; the
/// lock is never held across submission or wait. Fails with `InvalidExtent`
/// if `off` is at or beyond the end of the image; `len` is left untouched in
/// that case.
pub fn clip_io(image: &ImageCtx, off: u64, len: &mut u64) -> Result<()> {
    let size = image.size();
    if off >= size {
        return Err(VbdError::InvalidExtent {
            off,
            len: *len,
            size,
        });
    }
    let avail = size - off;
    if *len > avail {
        *len = avail;
    }
    Ok(())
}

fn clip_for_dispatch(image: &ImageCtx, off: u64, len: &mut u64) -> Result<()> {
    clip_io(image, off, len).inspect_err(|err| {
        tracing::error!(image = %image.name(), %err, "invalid I/O request");
    })
}

/// Readiness gate: an image without a backing data store fails the
/// completion with `NoDevice`; no dispatch request is built.
fn is_valid_io(image: &ImageCtx, comp: &Completion) -> bool {
    if image.data_store().is_none() {
        tracing::error!(image = %image.name(), "missing backing data store");
        comp.fail(VbdError::NoDevice);
        return false;
    }
    true
}

fn op_span(image: &ImageCtx, kind: IoKind) -> Span {
    if image.trace_all() {
        tracing::trace_span!("io", image = %image.name(), op = kind.as_str())
    } else {
        Span::none()
    }
}

fn arm_event_notify(image: &ImageCtx, comp: &Completion, native_async: bool) {
    if native_async {
        comp.set_event_notify(image.event_channel());
    }
}

/// Blocking read of `[off, off + len)` into `result`.
///
/// Returns the number of bytes read. The extent is clipped by the pipeline,
/// not here.
pub fn read(
    image: &Arc<ImageCtx>,
    off: u64,
    len: u64,
    result: ReadResult,
    flags: OpFlags,
) -> Result<u64> {
    tracing::trace!(image = %image.name(), off, len, "read");

    let (comp, waiter) = Completion::pair();
    aio_read(image, comp, off, len, result, flags, false);
    waiter.wait()
}

/// Blocking write of `data` at `off`. Returns the clipped length on success.
pub fn write(
    image: &Arc<ImageCtx>,
    off: u64,
    mut len: u64,
    data: Vec<u8>,
    flags: OpFlags,
) -> Result<u64> {
    tracing::trace!(image = %image.name(), off, len, "write");

    clip_for_dispatch(image, off, &mut len)?;

    let (comp, waiter) = Completion::pair();
    aio_write(image, comp, off, len, data, flags, false);

    waiter.wait()?;
    Ok(len)
}

/// Blocking discard of `[off, off + len)`. Returns the clipped length on
/// success.
pub fn discard(
    image: &Arc<ImageCtx>,
    off: u64,
    mut len: u64,
    granularity: u32,
    flags: OpFlags,
) -> Result<u64> {
    tracing::trace!(image = %image.name(), off, len, granularity, "discard");

    clip_for_dispatch(image, off, &mut len)?;

    let (comp, waiter) = Completion::pair();
    aio_discard(image, comp, off, len, granularity, flags, false);

    waiter.wait()?;
    Ok(len)
}

/// Blocking write-same: fill `[off, off + len)` with repetitions of `data`.
/// Returns the clipped length on success.
pub fn write_same(
    image: &Arc<ImageCtx>,
    off: u64,
    mut len: u64,
    data: Vec<u8>,
    flags: OpFlags,
) -> Result<u64> {
    tracing::trace!(image = %image.name(), off, len, data_len = data.len(), "write_same");

    clip_for_dispatch(image, off, &mut len)?;

    let (comp, waiter) = Completion::pair();
    aio_write_same(image, comp, off, len, data, flags, false);

    waiter.wait()?;
    Ok(len)
}

/// Blocking compare-and-write. On a full match `data` is written and the
/// clipped length returned; on a mismatch nothing is written, `mismatch`
/// holds the first differing relative offset, and `CompareMismatch` is
/// returned.
#[allow(clippy::too_many_arguments)]
pub fn compare_and_write(
    image: &Arc<ImageCtx>,
    off: u64,
    mut len: u64,
    cmp_data: Vec<u8>,
    data: Vec<u8>,
    mismatch: MismatchSlot,
    flags: OpFlags,
) -> Result<u64> {
    tracing::trace!(image = %image.name(), off, len, "compare_and_write");

    clip_for_dispatch(image, off, &mut len)?;

    let (comp, waiter) = Completion::pair();
    aio_compare_and_write(image, comp, off, len, cmp_data, data, mismatch, flags, false);

    waiter.wait()?;
    Ok(len)
}

/// Blocking user-initiated flush.
pub fn flush(image: &Arc<ImageCtx>) -> Result<()> {
    tracing::trace!(image = %image.name(), "flush");

    let (comp, waiter) = Completion::pair();
    aio_flush(image, comp, false);

    waiter.wait()?;
    Ok(())
}

/// Asynchronous read. The completion resolves with the byte count.
pub fn aio_read(
    image: &Arc<ImageCtx>,
    comp: Arc<Completion>,
    off: u64,
    len: u64,
    result: ReadResult,
    flags: OpFlags,
    native_async: bool,
) {
    let span = op_span(image, IoKind::Read);
    comp.init_time(IoKind::Read);
    tracing::trace!(image = %image.name(), off, len, flags = flags.bits(), "aio_read");

    arm_event_notify(image, &comp, native_async);
    if !is_valid_io(image, &comp) {
        return;
    }

    ImageDispatchSpec::create_read(
        Arc::clone(image),
        DispatchLayer::ApiStart,
        comp,
        vec![ImageExtent::new(off, len)],
        result,
        flags,
        span,
    )
    .send();
}

/// Asynchronous write. `off`/`len` are expected to be pre-clipped.
pub fn aio_write(
    image: &Arc<ImageCtx>,
    comp: Arc<Completion>,
    off: u64,
    len: u64,
    data: Vec<u8>,
    flags: OpFlags,
    native_async: bool,
) {
    let span = op_span(image, IoKind::Write);
    comp.init_time(IoKind::Write);
    tracing::trace!(image = %image.name(), off, len, flags = flags.bits(), "aio_write");

    arm_event_notify(image, &comp, native_async);
    if !is_valid_io(image, &comp) {
        return;
    }

    ImageDispatchSpec::create_write(
        Arc::clone(image),
        DispatchLayer::ApiStart,
        comp,
        vec![ImageExtent::new(off, len)],
        data,
        flags,
        span,
    )
    .send();
}

/// Asynchronous discard. `off`/`len` are expected to be pre-clipped.
pub fn aio_discard(
    image: &Arc<ImageCtx>,
    comp: Arc<Completion>,
    off: u64,
    len: u64,
    granularity: u32,
    flags: OpFlags,
    native_async: bool,
) {
    let span = op_span(image, IoKind::Discard);
    comp.init_time(IoKind::Discard);
    tracing::trace!(image = %image.name(), off, len, granularity, "aio_discard");

    arm_event_notify(image, &comp, native_async);
    if !is_valid_io(image, &comp) {
        return;
    }

    ImageDispatchSpec::create_discard(
        Arc::clone(image),
        DispatchLayer::ApiStart,
        comp,
        off,
        len,
        granularity,
        flags,
        span,
    )
    .send();
}

/// Asynchronous write-same. `off`/`len` are expected to be pre-clipped.
pub fn aio_write_same(
    image: &Arc<ImageCtx>,
    comp: Arc<Completion>,
    off: u64,
    len: u64,
    data: Vec<u8>,
    flags: OpFlags,
    native_async: bool,
) {
    let span = op_span(image, IoKind::WriteSame);
    comp.init_time(IoKind::WriteSame);
    tracing::trace!(
        image = %image.name(),
        off,
        len,
        data_len = data.len(),
        flags = flags.bits(),
        "aio_write_same"
    );

    arm_event_notify(image, &comp, native_async);
    if !is_valid_io(image, &comp) {
        return;
    }

    ImageDispatchSpec::create_write_same(
        Arc::clone(image),
        DispatchLayer::ApiStart,
        comp,
        off,
        len,
        data,
        flags,
        span,
    )
    .send();
}

/// Asynchronous compare-and-write. `off`/`len` are expected to be
/// pre-clipped.
#[allow(clippy::too_many_arguments)]
pub fn aio_compare_and_write(
    image: &Arc<ImageCtx>,
    comp: Arc<Completion>,
    off: u64,
    len: u64,
    cmp_data: Vec<u8>,
    data: Vec<u8>,
    mismatch: MismatchSlot,
    flags: OpFlags,
    native_async: bool,
) {
    let span = op_span(image, IoKind::CompareAndWrite);
    comp.init_time(IoKind::CompareAndWrite);
    tracing::trace!(image = %image.name(), off, len, "aio_compare_and_write");

    arm_event_notify(image, &comp, native_async);
    if !is_valid_io(image, &comp) {
        return;
    }

    ImageDispatchSpec::create_compare_and_write(
        Arc::clone(image),
        DispatchLayer::ApiStart,
        comp,
        vec![ImageExtent::new(off, len)],
        cmp_data,
        data,
        mismatch,
        flags,
        span,
    )
    .send();
}

/// Asynchronous user-initiated flush.
pub fn aio_flush(image: &Arc<ImageCtx>, comp: Arc<Completion>, native_async: bool) {
    let span = op_span(image, IoKind::Flush);
    comp.init_time(IoKind::Flush);
    tracing::trace!(image = %image.name(), "aio_flush");

    arm_event_notify(image, &comp, native_async);
    if !is_valid_io(image, &comp) {
        return;
    }

    ImageDispatchSpec::create_flush(
        Arc::clone(image),
        DispatchLayer::ApiStart,
        comp,
        FlushSource::User,
        span,
    )
    .send();
}
