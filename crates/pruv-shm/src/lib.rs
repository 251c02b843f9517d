//! Page-aligned POSIX shared-memory buffers for the pruv dispatcher and its
//! worker processes.
//!
//! A [`ShmBuffer`] wraps a named `shm_open` object: a resizable file with a
//! single memory-mapped window, a cursor inside the window, and a logical
//! data size. The dispatcher creates buffers with random names and unlinks
//! them on close; workers open existing objects by name through a
//! [`ShmCache`] and never unlink.

mod buffer;
mod cache;

pub use buffer::{ShmBuffer, NAME_PREFIX, REQUEST_CHUNK, RESPONSE_CHUNK};
pub use cache::ShmCache;
