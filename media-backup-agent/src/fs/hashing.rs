//! Streaming content hashes.
//!
//! Files are digested through a fixed-size buffer, so memory use does not
//! depend on file size.

use chrono::{DateTime, Utc};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

const BUFFER_SIZE: usize = 64 * 1024;

/// MD5 of the whole file as 32 lowercase hex chars.
pub fn content_hash(path: &Path) -> std::io::Result<String> {
    let file = File::open(path)?;
    digest_reader(BufReader::with_capacity(BUFFER_SIZE, file))
}

pub fn digest_reader<R: Read>(mut reader: R) -> std::io::Result<String> {
    let mut context = md5::Context::new();
    let mut buffer = vec![0u8; BUFFER_SIZE];

    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        context.consume(&buffer[..bytes_read]);
    }

    Ok(format!("{:x}", context.compute()))
}

/// Stable stand-in identity for a file whose content could not be read.
pub fn fallback_identity(path: &Path, last_modified: DateTime<Utc>) -> String {
    format!("{}_{}", path.display(), last_modified.timestamp_millis())
}
