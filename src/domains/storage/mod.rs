pub mod cloud_storage;
pub mod upload;

pub use cloud_storage::{
    CompletedPart, ObjectOptions, ObjectStorage, StorageProvider, StorageRegistry, UploadDestination,
};
pub use upload::{default_object_key, object_options, Uploader};
