//! Blob encoding for the `events.blob` column.
//!
//! The blob holds the zlib-compressed UTF-8 JSON of `[content, tags, sig]`
//! (or `[content, tags, null]` when signatures are stripped). `id`,
//! `pubkey`, `kind`, `created_at` live in their own columns and are not
//! duplicated inside the blob.

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::io::{Read, Write};

use super::Error;

/// The decoded payload of one blob, paired back up with its row columns
/// by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobPayload {
    pub content: String,
    pub tags: serde_json::Value,
    pub sig: Option<String>,
}

/// Compresses `[content, tags, sig]`. flate2's safe API does not expose the
/// zlib memory-level/strategy knobs the original describes, so the closest
/// available equivalent is used: the fastest compression level, which keeps
/// memory pressure and CPU cost low for what are mostly small JSON blobs.
pub fn encode(content: &str, tags: &serde_json::Value, sig: Option<&str>) -> Result<Vec<u8>, Error> {
    let triple = serde_json::json!([content, tags, sig]);
    let json = serde_json::to_vec(&triple).map_err(Error::Json)?;

    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::fast());
    encoder.write_all(&json).map_err(Error::Io)?;
    encoder.finish().map_err(Error::Io)
}

pub fn decode(blob: &[u8]) -> Result<BlobPayload, Error> {
    let mut decoder = ZlibDecoder::new(blob);
    let mut json = Vec::new();
    decoder.read_to_end(&mut json).map_err(Error::Io)?;

    let triple: (String, serde_json::Value, Option<String>) =
        serde_json::from_slice(&json).map_err(Error::Json)?;

    Ok(BlobPayload {
        content: triple.0,
        tags: triple.1,
        sig: triple.2,
    })
}
