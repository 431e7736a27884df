//! MP3 helpers for pacing and joining prepared audio.

use std::path::Path;

use tokio::io::AsyncReadExt;
use tracing::{debug, warn};

use crate::config::DEFAULT_BITRATE;

const HEADER_SCAN_BYTES: usize = 8192;

// MPEG-1 Layer III, kbps
const MPEG1_L3_BITRATES: [u64; 16] = [0, 32, 40, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320, 0];

/// Length in bytes of a leading ID3v2 tag (header included), or 0 if absent.
pub fn id3v2_len(data: &[u8]) -> usize {
    if data.len() < 10 || &data[..3] != b"ID3" {
        return 0;
    }
    let size = ((data[6] as usize & 0x7F) << 21)
        | ((data[7] as usize & 0x7F) << 14)
        | ((data[8] as usize & 0x7F) << 7)
        | (data[9] as usize & 0x7F);
    // footer present flag
    let footer = if data[5] & 0x10 != 0 { 10 } else { 0 };
    10 + size + footer
}

/// Bitrate in bits/s of the first MPEG-1 Layer III frame header in `data`.
pub fn header_bitrate(data: &[u8]) -> Option<u64> {
    let mut offset = id3v2_len(data);
    while offset + 4 <= data.len() {
        if data[offset] == 0xFF && (data[offset + 1] & 0xE0) == 0xE0 {
            let header = u32::from_be_bytes([data[offset], data[offset + 1], data[offset + 2], data[offset + 3]]);
            let version = (header >> 19) & 3;
            let layer = (header >> 17) & 3;
            let index = ((header >> 12) & 0xF) as usize;

            if version == 3 && layer == 1 && index > 0 && index < 15 {
                return Some(MPEG1_L3_BITRATES[index] * 1000);
            }
        }
        offset += 1;
    }
    None
}

/// True bitrate of the file in bits/s: size over decoded duration, else the
/// first frame header, else `DEFAULT_BITRATE`.
pub async fn probe_bitrate(path: &Path) -> u64 {
    let size = match tokio::fs::metadata(path).await {
        Ok(meta) => meta.len(),
        Err(e) => {
            warn!("Cannot stat {}: {}", path.display(), e);
            return DEFAULT_BITRATE;
        }
    };

    let owned = path.to_path_buf();
    let duration = tokio::task::spawn_blocking(move || mp3_duration::from_path(&owned)).await;
    match duration {
        Ok(Ok(duration)) if duration.as_secs_f64() > 0.0 => {
            let bitrate = (size as f64 * 8.0 / duration.as_secs_f64()) as u64;
            debug!("{}: {} bytes over {:?} = {} bps", path.display(), size, duration, bitrate);
            return bitrate.max(1);
        }
        Ok(Ok(_)) => debug!("{} reports zero duration", path.display()),
        Ok(Err(e)) => debug!("Could not get duration for {}: {}", path.display(), e),
        Err(e) => warn!("Duration probe task failed: {}", e),
    }

    match read_head(path).await.and_then(|head| header_bitrate(&head)) {
        Some(bitrate) => bitrate,
        None => {
            warn!("Falling back to default bitrate for {}", path.display());
            DEFAULT_BITRATE
        }
    }
}

async fn read_head(path: &Path) -> Option<Vec<u8>> {
    let mut file = tokio::fs::File::open(path).await.ok()?;
    let mut buffer = vec![0u8; HEADER_SCAN_BYTES];
    let read = file.read(&mut buffer).await.ok()?;
    buffer.truncate(read);
    Some(buffer)
}
