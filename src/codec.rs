use std::io::{Read, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;

use crate::error::{Error, Result};

/// magic prefix of the encrypted blob wire format
pub const FRAME_MAGIC: &[u8; 7] = b"WALGIT1";

/// 96-bit GCM iv length
pub const IV_LEN: usize = 12;
/// 128-bit GCM tag length
pub const TAG_LEN: usize = 16;

/// payloads larger than this compress at the fast level
const FAST_THRESHOLD: u64 = 50 * 1024 * 1024;
/// payloads smaller than this compress at the best level
const BEST_THRESHOLD: u64 = 5 * 1024 * 1024;

/// zlib-deflate bytes at the given level (0 = store, 9 = best)
pub fn compress(bytes: &[u8], level: u32) -> Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::new(level.min(9)));
    encoder
        .write_all(bytes)
        .map_err(|e| Error::Codec(format!("deflate: {}", e)))?;
    encoder
        .finish()
        .map_err(|e| Error::Codec(format!("deflate: {}", e)))
}

/// inflate zlib-deflated bytes
pub fn decompress(bytes: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = ZlibDecoder::new(bytes);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| Error::Codec(format!("inflate: {}", e)))?;
    Ok(out)
}

/// pick a compression level from payload size and detected content type
///
/// already-compressed formats are stored, very large payloads use the fast
/// level, small payloads get the best ratio.
pub fn adaptive_level(size: u64, content_type: Option<&str>) -> u32 {
    if let Some(ct) = content_type {
        if is_precompressed(ct) {
            return 0;
        }
    }
    if size > FAST_THRESHOLD {
        1
    } else if size < BEST_THRESHOLD {
        9
    } else {
        6
    }
}

/// formats that gain nothing from another deflate pass
fn is_precompressed(content_type: &str) -> bool {
    matches!(
        content_type,
        "image/jpeg"
            | "image/png"
            | "image/gif"
            | "image/webp"
            | "audio/mp3"
            | "audio/mpeg"
            | "video/mp4"
            | "application/zip"
            | "application/gzip"
            | "application/x-7z-compressed"
            | "application/zstd"
    )
}

/// sniff a content type from magic bytes, falling back to the extension
pub fn sniff_content_type(bytes: &[u8], name: Option<&str>) -> Option<&'static str> {
    if bytes.len() >= 4 {
        if bytes.starts_with(&[0xff, 0xd8, 0xff]) {
            return Some("image/jpeg");
        }
        if bytes.starts_with(&[0x89, b'P', b'N', b'G']) {
            return Some("image/png");
        }
        if bytes.starts_with(b"GIF8") {
            return Some("image/gif");
        }
        if bytes.starts_with(&[0x50, 0x4b, 0x03, 0x04]) {
            return Some("application/zip");
        }
        if bytes.starts_with(&[0x1f, 0x8b]) {
            return Some("application/gzip");
        }
        if bytes.starts_with(b"%PDF") {
            return Some("application/pdf");
        }
        if bytes.starts_with(b"ID3") || bytes.starts_with(&[0xff, 0xfb]) {
            return Some("audio/mpeg");
        }
        if bytes.len() >= 12 && &bytes[4..8] == b"ftyp" {
            return Some("video/mp4");
        }
    }

    let ext = name.and_then(|n| n.rsplit('.').next())?;
    match ext.to_ascii_lowercase().as_str() {
        "jpg" | "jpeg" => Some("image/jpeg"),
        "png" => Some("image/png"),
        "gif" => Some("image/gif"),
        "mp3" => Some("audio/mpeg"),
        "mp4" => Some("video/mp4"),
        "zip" => Some("application/zip"),
        "gz" => Some("application/gzip"),
        "pdf" => Some("application/pdf"),
        "txt" | "md" => Some("text/plain"),
        "json" => Some("application/json"),
        _ => None,
    }
}

/// assemble the encrypted blob wire format:
/// `"WALGIT1"(7) | iv(12) | gcm_tag(16) | ciphertext`
pub fn frame(iv: &[u8; IV_LEN], tag: &[u8; TAG_LEN], ciphertext: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(FRAME_MAGIC.len() + IV_LEN + TAG_LEN + ciphertext.len());
    out.extend_from_slice(FRAME_MAGIC);
    out.extend_from_slice(iv);
    out.extend_from_slice(tag);
    out.extend_from_slice(ciphertext);
    out
}

/// split an encrypted blob frame into (iv, tag, ciphertext)
pub fn unframe(bytes: &[u8]) -> Result<([u8; IV_LEN], [u8; TAG_LEN], &[u8])> {
    let header_len = FRAME_MAGIC.len() + IV_LEN + TAG_LEN;
    if bytes.len() < header_len || &bytes[..FRAME_MAGIC.len()] != FRAME_MAGIC {
        return Err(Error::Format("encrypted blob frame".to_string()));
    }
    let mut iv = [0u8; IV_LEN];
    let mut tag = [0u8; TAG_LEN];
    iv.copy_from_slice(&bytes[FRAME_MAGIC.len()..FRAME_MAGIC.len() + IV_LEN]);
    tag.copy_from_slice(&bytes[FRAME_MAGIC.len() + IV_LEN..header_len]);
    Ok((iv, tag, &bytes[header_len..]))
}
