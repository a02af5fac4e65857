//! digitread-io: Filesystem adapters for the recognition pipeline.
//!
//! Persists trained models, loads the reference training dataset, and
//! validates image files before they reach the pipeline.

pub mod dataset;
pub mod store;
pub mod upload;

pub use dataset::FsDatasetSource;
pub use store::FsModelStore;
pub use upload::{
    ALLOWED_EXTENSIONS, IoError, MAX_UPLOAD_BYTES, UploadRejection, has_allowed_extension,
    read_upload, validate_upload,
};
