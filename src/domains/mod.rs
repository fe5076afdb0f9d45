pub mod compression;
pub mod encryption;
pub mod export;
pub mod notification;
pub mod storage;
