//! Avatar payload preparation: size checks and raster scaling.
//!
//! Raster images are scaled to fit 64x64 preserving aspect ratio and
//! re-encoded as PNG; vector images pass through under a tighter size cap.
//! Decoding and scaling are CPU-bound and run on the blocking thread pool.

use std::io::Cursor;

/// Hard cap on an incoming avatar payload.
pub const MAX_AVATAR_BYTES: usize = 1024 * 1024;
/// Vector images are stored verbatim and capped tighter.
pub const MAX_VECTOR_BYTES: usize = 64 * 1024;
/// Maximum edge length of a stored raster avatar.
pub const MAX_EDGE: u32 = 64;

#[derive(Debug, Clone)]
pub struct PreparedAvatar {
    pub mime_type: String,
    pub data: Vec<u8>,
}

/// Validate and normalise an avatar payload. Returns `None` when the
/// payload is oversized or cannot be decoded.
pub async fn prepare_avatar(mime_type: &str, data: Vec<u8>) -> Option<PreparedAvatar> {
    if data.len() > MAX_AVATAR_BYTES {
        eprintln!(
            "⚠️ avatar: rejecting {} byte payload (limit {})",
            data.len(),
            MAX_AVATAR_BYTES
        );
        return None;
    }

    if mime_type.starts_with("image/svg") {
        if data.len() > MAX_VECTOR_BYTES {
            eprintln!(
                "⚠️ avatar: rejecting {} byte vector payload (limit {})",
                data.len(),
                MAX_VECTOR_BYTES
            );
            return None;
        }
        return Some(PreparedAvatar {
            mime_type: mime_type.to_string(),
            data,
        });
    }

    let handle = tokio::task::spawn_blocking(move || scale_to_png(&data));
    match handle.await {
        Ok(Some(png)) => Some(PreparedAvatar {
            mime_type: "image/png".to_string(),
            data: png,
        }),
        Ok(None) => None,
        Err(e) => {
            eprintln!("⚠️ avatar: scaling task failed: {e}");
            None
        }
    }
}

fn scale_to_png(data: &[u8]) -> Option<Vec<u8>> {
    let img = match image::load_from_memory(data) {
        Ok(img) => img,
        Err(e) => {
            eprintln!("⚠️ avatar: failed to decode image: {e}");
            return None;
        }
    };

    let scaled = if img.width() > MAX_EDGE || img.height() > MAX_EDGE {
        img.thumbnail(MAX_EDGE, MAX_EDGE)
    } else {
        img
    };

    let mut out = Vec::new();
    if let Err(e) = scaled.write_to(&mut Cursor::new(&mut out), image::ImageFormat::Png) {
        eprintln!("⚠️ avatar: failed to encode png: {e}");
        return None;
    }
    Some(out)
}
