#![forbid(unsafe_code)]
//! Typed dispatch requests and their asynchronous execution.
//!
//! An [`ImageDispatchSpec`] is the immutable description of one I/O
//! operation: the image, the pipeline entry layer, the completion to
//! resolve, and an [`ImageRequest`] variant carrying only the fields its
//! kind needs. Builders are per-kind; [`send`](ImageDispatchSpec::send) is
//! fire-and-forget — the request executes on a worker thread against the
//! image's backing store and the submitting thread never blocks.
//!
//! Read extents are clipped against the image size here, during execution,
//! not by the API layer; write-side extents arrive already clipped. Keep
//! that asymmetry.

use std::sync::Arc;
use std::thread;
use tracing::Span;
use vbd_completion::Completion;
use vbd_error::VbdError;
use vbd_image::ImageCtx;
use vbd_store::DataStore;
use vbd_types::{DispatchLayer, FlushSource, ImageExtent, IoKind, MismatchSlot, OpFlags, ReadResult};

/// Tagged union over operation kind; each variant carries only the fields
/// relevant to its kind.
#[derive(Debug)]
pub enum ImageRequest {
    Read {
        extents: Vec<ImageExtent>,
        result: ReadResult,
        flags: OpFlags,
    },
    Write {
        extents: Vec<ImageExtent>,
        data: Vec<u8>,
        flags: OpFlags,
    },
    Discard {
        off: u64,
        len: u64,
        granularity: u32,
        flags: OpFlags,
    },
    WriteSame {
        off: u64,
        len: u64,
        data: Vec<u8>,
        flags: OpFlags,
    },
    CompareAndWrite {
        extents: Vec<ImageExtent>,
        cmp_data: Vec<u8>,
        data: Vec<u8>,
        mismatch: MismatchSlot,
        flags: OpFlags,
    },
    Flush {
        source: FlushSource,
    },
}

impl ImageRequest {
    #[must_use]
    pub fn kind(&self) -> IoKind {
        match self {
            Self::Read { .. } => IoKind::Read,
            Self::Write { .. } => IoKind::Write,
            Self::Discard { .. } => IoKind::Discard,
            Self::WriteSame { .. } => IoKind::WriteSame,
            Self::CompareAndWrite { .. } => IoKind::CompareAndWrite,
            Self::Flush { .. } => IoKind::Flush,
        }
    }
}

/// One pending I/O, ready for submission.
///
/// Ownership transfers to the pipeline on [`send`](Self::send); the builder
/// side never touches it again. The outcome is delivered through the
/// completion.
#[derive(Debug)]
pub struct ImageDispatchSpec {
    image: Arc<ImageCtx>,
    layer: DispatchLayer,
    completion: Arc<Completion>,
    request: ImageRequest,
    span: Span,
}

impl ImageDispatchSpec {
    #[must_use]
    pub fn create_read(
        image: Arc<ImageCtx>,
        layer: DispatchLayer,
        completion: Arc<Completion>,
        extents: Vec<ImageExtent>,
        result: ReadResult,
        flags: OpFlags,
        span: Span,
    ) -> Self {
        Self {
            image,
            layer,
            completion,
            request: ImageRequest::Read {
                extents,
                result,
                flags,
            },
            span,
        }
    }

    #[must_use]
    pub fn create_write(
        image: Arc<ImageCtx>,
        layer: DispatchLayer,
        completion: Arc<Completion>,
        extents: Vec<ImageExtent>,
        data: Vec<u8>,
        flags: OpFlags,
        span: Span,
    ) -> Self {
        Self {
            image,
            layer,
            completion,
            request: ImageRequest::Write {
                extents,
                data,
                flags,
            },
            span,
        }
    }

    #[must_use]
    pub fn create_discard(
        image: Arc<ImageCtx>,
        layer: DispatchLayer,
        completion: Arc<Completion>,
        off: u64,
        len: u64,
        granularity: u32,
        flags: OpFlags,
        span: Span,
    ) -> Self {
        Self {
            image,
            layer,
            completion,
            request: ImageRequest::Discard {
                off,
                len,
                granularity,
                flags,
            },
            span,
        }
    }

    #[must_use]
    pub fn create_write_same(
        image: Arc<ImageCtx>,
        layer: DispatchLayer,
        completion: Arc<Completion>,
        off: u64,
        len: u64,
        data: Vec<u8>,
        flags: OpFlags,
        span: Span,
    ) -> Self {
        Self {
            image,
            layer,
            completion,
            request: ImageRequest::WriteSame {
                off,
                len,
                data,
                flags,
            },
            span,
        }
    }

    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn create_compare_and_write(
        image: Arc<ImageCtx>,
        layer: DispatchLayer,
        completion: Arc<Completion>,
        extents: Vec<ImageExtent>,
        cmp_data: Vec<u8>,
        data: Vec<u8>,
        mismatch: MismatchSlot,
        flags: OpFlags,
        span: Span,
    ) -> Self {
        Self {
            image,
            layer,
            completion,
            request: ImageRequest::CompareAndWrite {
                extents,
                cmp_data,
                data,
                mismatch,
                flags,
            },
            span,
        }
    }

    #[must_use]
    pub fn create_flush(
        image: Arc<ImageCtx>,
        layer: DispatchLayer,
        completion: Arc<Completion>,
        source: FlushSource,
        span: Span,
    ) -> Self {
        Self {
            image,
            layer,
            completion,
            request: ImageRequest::Flush { source },
            span,
        }
    }

    #[must_use]
    pub fn kind(&self) -> IoKind {
        self.request.kind()
    }

    /// Submit for asynchronous execution. Fire-and-forget: the result is
    /// delivered later through the completion.
    pub fn send(self) {
        let Self {
            image,
            layer,
            completion,
            request,
            span,
        } = self;
        tracing::trace!(
            image = %image.name(),
            layer = ?layer,
            kind = request.kind().as_str(),
            "dispatch request submitted"
        );

        thread::spawn(move || {
            let _entered = span.enter();
            let result = execute(&image, request);
            completion.complete(result);
        });
    }
}

/// Execute one request against the image's backing store.
///
/// The store is re-fetched here: a store detached between the readiness gate
/// and execution fails the operation rather than touching stale state.
fn execute(image: &ImageCtx, request: ImageRequest) -> Result<u64, VbdError> {
    let Some(store) = image.data_store() else {
        return Err(VbdError::NoDevice);
    };

    match request {
        ImageRequest::Read {
            extents,
            result,
            flags: _,
        } => {
            // Deferred read clipping: reads are bounded against the image
            // size at execution time, unlike the write-side ops which the
            // API layer clips before submission.
            let size = image.size();
            let mut out = Vec::new();
            for extent in extents {
                if extent.off >= size {
                    return Err(VbdError::InvalidExtent {
                        off: extent.off,
                        len: extent.len,
                        size,
                    });
                }
                let len = extent.len.min(size - extent.off);
                let mut bytes = store.read_at(extent.off, len)?;
                // Logical space past the end of a short store reads as zeros.
                let want = usize::try_from(len).map_err(|_| {
                    VbdError::InvalidArgument("read length overflows usize".to_owned())
                })?;
                bytes.resize(want, 0);
                out.extend_from_slice(&bytes);
            }
            let n = out.len() as u64;
            result.fill(out);
            Ok(n)
        }
        ImageRequest::Write {
            extents,
            data,
            flags: _,
        } => {
            let mut written = 0_u64;
            let mut consumed = 0_usize;
            for extent in extents {
                let len = usize::try_from(extent.len).map_err(|_| {
                    VbdError::InvalidArgument("write length overflows usize".to_owned())
                })?;
                let end = consumed.checked_add(len).ok_or_else(|| {
                    VbdError::InvalidArgument("write payload overflow".to_owned())
                })?;
                if end > data.len() {
                    return Err(VbdError::InvalidArgument(format!(
                        "write payload too short: need {end} bytes, have {}",
                        data.len()
                    )));
                }
                store.write_at(extent.off, &data[consumed..end])?;
                consumed = end;
                written += extent.len;
            }
            Ok(written)
        }
        ImageRequest::Discard {
            off,
            len,
            granularity,
            flags: _,
        } => {
            store.discard(off, len, granularity)?;
            Ok(len)
        }
        ImageRequest::WriteSame {
            off,
            len,
            data,
            flags: _,
        } => {
            store.write_same(off, len, &data)?;
            Ok(len)
        }
        ImageRequest::CompareAndWrite {
            extents,
            cmp_data,
            data,
            mismatch,
            flags: _,
        } => {
            let extent = extents.first().copied().ok_or_else(|| {
                VbdError::InvalidArgument("compare-and-write requires an extent".to_owned())
            })?;
            let len = usize::try_from(extent.len).map_err(|_| {
                VbdError::InvalidArgument("compare length overflows usize".to_owned())
            })?;
            if cmp_data.len() < len || data.len() < len {
                return Err(VbdError::InvalidArgument(format!(
                    "compare-and-write payloads shorter than extent: len={len} cmp={} data={}",
                    cmp_data.len(),
                    data.len()
                )));
            }
            match store.compare_and_write(extent.off, &cmp_data[..len], &data[..len])? {
                None => Ok(extent.len),
                Some(off) => {
                    mismatch.set(off);
                    Err(VbdError::CompareMismatch { off })
                }
            }
        }
        ImageRequest::Flush { source } => {
            tracing::trace!(source = ?source, "flush");
            store.flush()?;
            Ok(0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vbd_store::MemoryDataStore;

    fn image_with_store(len: usize) -> Arc<ImageCtx> {
        ImageCtx::with_store("test", Arc::new(MemoryDataStore::new(len)))
    }

    #[test]
    fn write_then_read_resolves_completions() {
        let image = image_with_store(1024);

        let (comp, waiter) = Completion::pair();
        comp.init_time(IoKind::Write);
        ImageDispatchSpec::create_write(
            Arc::clone(&image),
            DispatchLayer::ApiStart,
            comp,
            vec![ImageExtent::new(64, 16)],
            vec![9_u8; 16],
            OpFlags::NONE,
            Span::none(),
        )
        .send();
        assert_eq!(waiter.wait().expect("write"), 16);

        let result = ReadResult::new();
        let (comp, waiter) = Completion::pair();
        comp.init_time(IoKind::Read);
        ImageDispatchSpec::create_read(
            image,
            DispatchLayer::ApiStart,
            comp,
            vec![ImageExtent::new(64, 16)],
            result.clone(),
            OpFlags::NONE,
            Span::none(),
        )
        .send();
        assert_eq!(waiter.wait().expect("read"), 16);
        assert_eq!(result.take(), vec![9_u8; 16]);
    }

    #[test]
    fn read_is_clipped_during_execution() {
        let image = image_with_store(100);

        let result = ReadResult::new();
        let (comp, waiter) = Completion::pair();
        comp.init_time(IoKind::Read);
        ImageDispatchSpec::create_read(
            image,
            DispatchLayer::ApiStart,
            comp,
            vec![ImageExtent::new(90, 50)],
            result.clone(),
            OpFlags::NONE,
            Span::none(),
        )
        .send();

        assert_eq!(waiter.wait().expect("read"), 10);
        assert_eq!(result.len(), 10);
    }

    #[test]
    fn read_past_end_fails_in_pipeline() {
        let image = image_with_store(100);

        let (comp, waiter) = Completion::pair();
        comp.init_time(IoKind::Read);
        ImageDispatchSpec::create_read(
            image,
            DispatchLayer::ApiStart,
            comp,
            vec![ImageExtent::new(100, 10)],
            ReadResult::new(),
            OpFlags::NONE,
            Span::none(),
        )
        .send();

        assert!(matches!(
            waiter.wait(),
            Err(VbdError::InvalidExtent { off: 100, .. })
        ));
    }

    #[test]
    fn store_detached_before_execution_fails_with_no_device() {
        let image = image_with_store(100);
        image.detach_store();

        let (comp, waiter) = Completion::pair();
        comp.init_time(IoKind::Flush);
        ImageDispatchSpec::create_flush(
            image,
            DispatchLayer::ApiStart,
            comp,
            FlushSource::User,
            Span::none(),
        )
        .send();

        assert!(matches!(waiter.wait(), Err(VbdError::NoDevice)));
    }

    #[test]
    fn compare_and_write_mismatch_sets_slot_and_fails() {
        let image = image_with_store(100);
        let slot = MismatchSlot::new();

        // Store is zero-filled; compare against a pattern that differs at
        // relative offset 3.
        let mut cmp = vec![0_u8; 8];
        cmp[3] = 1;

        let (comp, waiter) = Completion::pair();
        comp.init_time(IoKind::CompareAndWrite);
        ImageDispatchSpec::create_compare_and_write(
            image,
            DispatchLayer::ApiStart,
            comp,
            vec![ImageExtent::new(0, 8)],
            cmp,
            vec![7_u8; 8],
            slot.clone(),
            OpFlags::NONE,
            Span::none(),
        )
        .send();

        assert!(matches!(
            waiter.wait(),
            Err(VbdError::CompareMismatch { off: 3 })
        ));
        assert_eq!(slot.get(), Some(3));
    }

    #[test]
    fn clipped_write_consumes_payload_prefix() {
        let image = image_with_store(1000);

        // Simulates an already-clipped extent: 200-byte payload, 100-byte
        // extent. Only the prefix lands.
        let mut data = vec![1_u8; 100];
        data.extend_from_slice(&[2_u8; 100]);

        let (comp, waiter) = Completion::pair();
        comp.init_time(IoKind::Write);
        ImageDispatchSpec::create_write(
            Arc::clone(&image),
            DispatchLayer::ApiStart,
            comp,
            vec![ImageExtent::new(900, 100)],
            data,
            OpFlags::NONE,
            Span::none(),
        )
        .send();
        assert_eq!(waiter.wait().expect("write"), 100);

        let result = ReadResult::new();
        let (comp, waiter) = Completion::pair();
        comp.init_time(IoKind::Read);
        ImageDispatchSpec::create_read(
            image,
            DispatchLayer::ApiStart,
            comp,
            vec![ImageExtent::new(900, 100)],
            result.clone(),
            OpFlags::NONE,
            Span::none(),
        )
        .send();
        assert_eq!(waiter.wait().expect("read"), 100);
        assert_eq!(result.take(), vec![1_u8; 100]);
    }
}
