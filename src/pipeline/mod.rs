//! Pipeline stages for resolving an upscale response into an image.
//!
//! Each submodule implements one step and is testable on its own.
//!
//! ## Data Flow
//!
//! ```text
//! request ──▶ (transport) ──▶ signature ──▶ decode ──┬──▶ normalize
//! (validate,                  (bytes →     (URL /    │
//!  multipart)                  binary|JSON) base64 / └──▶ poll ──▶ normalize
//!                                           ticket)
//! ```
//!
//! 1. [`request`]: local validation and `multipart/form-data` construction
//! 2. [`signature`]: magic-byte classification, ignoring the content type
//! 3. [`decode`]: direct URL, nested base64 envelope, or job ticket
//! 4. [`poll`]: bounded, cancellable status loop for job tickets
//! 5. [`normalize`]: the one place a completed [`crate::UpscaleResult`] is built
//!
//! [`materialize`] is shared plumbing: temp files, downloads, atomic saves.

pub mod decode;
pub mod materialize;
pub mod normalize;
pub mod poll;
pub mod request;
pub mod signature;
