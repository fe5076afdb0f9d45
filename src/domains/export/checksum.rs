use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::PathBuf;
use tokio::task;

use crate::errors::PipelineResult;

const READ_BUFFER: usize = 64 * 1024;

/// SHA-256 over the concatenation of `paths` in order, hex encoded.
pub async fn sha256_files(paths: &[PathBuf]) -> PipelineResult<String> {
    let paths = paths.to_vec();
    task::spawn_blocking(move || {
        let mut hasher = Sha256::new();
        let mut buffer = vec![0u8; READ_BUFFER];
        for path in &paths {
            let mut file = std::fs::File::open(path)?;
            loop {
                let read = file.read(&mut buffer)?;
                if read == 0 {
                    break;
                }
                hasher.update(&buffer[..read]);
            }
        }
        Ok(hex::encode(hasher.finalize()))
    })
    .await?
}

/// Total size in bytes of `paths`.
pub async fn total_size(paths: &[PathBuf]) -> PipelineResult<u64> {
    let mut total = 0;
    for path in paths {
        total += tokio::fs::metadata(path).await?.len();
    }
    Ok(total)
}
