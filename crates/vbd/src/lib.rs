#![forbid(unsafe_code)]
//! vbd public API facade.
//!
//! Re-exports the image I/O surface through a single crate: the blocking and
//! asynchronous operation forms live in [`io`], everything they consume or
//! produce is re-exported at the root.
//!
//! ```
//! use std::sync::Arc;
//! use vbd::{ImageCtx, MemoryDataStore, OpFlags, ReadResult};
//!
//! let store = Arc::new(MemoryDataStore::new(1000));
//! let image = ImageCtx::with_store("demo", store);
//!
//! // Overrunning writes are clipped against the image size.
//! let n = vbd::io::write(&image, 900, 200, vec![7; 200], OpFlags::NONE)?;
//! assert_eq!(n, 100);
//!
//! let result = ReadResult::new();
//! vbd::io::read(&image, 900, 100, result.clone(), OpFlags::NONE)?;
//! assert_eq!(result.take(), vec![7; 100]);
//! # Ok::<(), vbd::VbdError>(())
//! ```

pub use vbd_completion::{Completion, CompletionEvent, CompletionWaiter};
pub use vbd_dispatch::{ImageDispatchSpec, ImageRequest};
pub use vbd_error::{Result, VbdError};
pub use vbd_image::ImageCtx;
pub use vbd_store::{DataStore, FileDataStore, MemoryDataStore};
pub use vbd_types::{
    DispatchLayer, FlushSource, ImageExtent, IoKind, MismatchSlot, OpFlags, ReadResult,
};

/// Blocking and asynchronous image I/O operations.
pub mod io {
    pub use vbd_io::{
        aio_compare_and_write, aio_discard, aio_flush, aio_read, aio_write, aio_write_same,
        clip_io, compare_and_write, discard, flush, read, write, write_same,
    };
}
