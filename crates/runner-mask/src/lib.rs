//! Output masking for job helper child processes.
//!
//! [`Store`] keeps the phrases to hide in an append-only file encrypted with
//! XChaCha20-Poly1305. [`Masker`] filters a byte stream against the phrases
//! currently in the store, and [`Proxy`] pairs two maskers for a child's
//! stdout and stderr.

pub mod error;
pub mod masker;
pub mod proxy;
pub mod store;

pub use error::{ListError, MaskError, StoreError};
pub use masker::{Masker, MASK};
pub use proxy::Proxy;
pub use store::{key_path, Store, KEY_SIZE, STORE_FILE};
