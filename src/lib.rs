//! Embedded, append-only, log-structured record store.
//!
//! Each store is a `<name>.dat` / `<name>.idx` file pair. Records carry a
//! monotonically increasing seqnum, a non-decreasing timestamp, and two
//! opaque byte payloads. [`Store::open`] recovers from a prior crash —
//! truncated tails are zeroed and an inconsistent index is rebuilt from
//! the data file — so callers never need to run a separate repair step.
//!
//! ```no_run
//! use seqlog::{Entry, OpenOptions};
//!
//! let store = OpenOptions::new().open("/tmp/mydb", "events")?;
//! let mut entries = vec![Entry::new(Vec::new(), b"hello".to_vec())];
//! let (written, result) = store.append(&mut entries);
//! result?;
//! assert_eq!(written, 1);
//! # Ok::<(), seqlog::StoreError>(())
//! ```

mod crc32;
mod error;
mod format;
mod state;
mod store;

pub use error::{Result, StoreError};
pub use state::{Entry, SearchMode, State, Stats};
pub use store::{OpenOptions, Store};
