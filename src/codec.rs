//! Frame codec: compressed frame bytes → renderable point-cloud buffer.
//!
//! The pipeline only needs "submit raw bytes, receive renderable buffer or
//! failure"; the `FrameCodec` trait is that seam. The built-in codec reads
//! the volustream frame container: a fixed header followed by an LZ4 block
//! holding packed positions and colors.
//!
//! Container layout (little-endian):
//!
//! ```text
//! [0..4)   magic  "VLS1"
//! [4..8)   u32    point count
//! [8..)    lz4    size-prepended block: count * 12 bytes of f32 xyz
//!                 positions, then count * 4 bytes of RGBA colors
//! ```

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;
use thiserror::Error;

/// Container magic, `VLS1`.
pub const FRAME_MAGIC: [u8; 4] = *b"VLS1";

/// A decoded, renderable point-cloud frame.
#[derive(Clone, Debug, PartialEq)]
pub struct PointCloud {
    pub positions: Vec<[f32; 3]>,
    pub colors: Vec<[u8; 4]>,
}

impl PointCloud {
    pub fn point_count(&self) -> usize {
        self.positions.len()
    }
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("frame truncated ({0} bytes)")]
    Truncated(usize),

    #[error("bad frame magic {0:02x?}")]
    BadMagic([u8; 4]),

    #[error("decompression failed: {0}")]
    Decompress(#[from] lz4_flex::block::DecompressError),

    #[error("payload is {got} bytes, expected {want} for {points} points")]
    SizeMismatch { got: usize, want: usize, points: usize },
}

/// Decode collaborator seam. Implementations must tolerate being invoked
/// concurrently for different frames.
pub trait FrameCodec: Send + Sync + 'static {
    fn decode(&self, bytes: &[u8]) -> Result<PointCloud, CodecError>;
}

/// Built-in decoder for the volustream LZ4 frame container.
#[derive(Debug, Default)]
pub struct Lz4PointCodec;

impl FrameCodec for Lz4PointCodec {
    fn decode(&self, bytes: &[u8]) -> Result<PointCloud, CodecError> {
        if bytes.len() < 8 {
            return Err(CodecError::Truncated(bytes.len()));
        }

        let mut magic = [0u8; 4];
        magic.copy_from_slice(&bytes[0..4]);
        if magic != FRAME_MAGIC {
            return Err(CodecError::BadMagic(magic));
        }

        let mut header = Cursor::new(&bytes[4..8]);
        let points = header
            .read_u32::<LittleEndian>()
            .map_err(|_| CodecError::Truncated(bytes.len()))? as usize;

        let payload = lz4_flex::block::decompress_size_prepended(&bytes[8..])?;

        let want = points * 16;
        if payload.len() != want {
            return Err(CodecError::SizeMismatch { got: payload.len(), want, points });
        }

        let (pos_bytes, color_bytes) = payload.split_at(points * 12);

        let mut positions = Vec::with_capacity(points);
        let mut cursor = Cursor::new(pos_bytes);
        for _ in 0..points {
            let x = cursor.read_f32::<LittleEndian>().map_err(|_| CodecError::Truncated(bytes.len()))?;
            let y = cursor.read_f32::<LittleEndian>().map_err(|_| CodecError::Truncated(bytes.len()))?;
            let z = cursor.read_f32::<LittleEndian>().map_err(|_| CodecError::Truncated(bytes.len()))?;
            positions.push([x, y, z]);
        }

        let colors = color_bytes
            .chunks_exact(4)
            .map(|c| [c[0], c[1], c[2], c[3]])
            .collect();

        Ok(PointCloud { positions, colors })
    }
}

/// Encode a point cloud into the frame container. Used by asset tooling
/// and by the test suite to fabricate frame files.
pub fn encode_frame(cloud: &PointCloud) -> Vec<u8> {
    let points = cloud.point_count();
    let mut payload = Vec::with_capacity(points * 16);
    for p in &cloud.positions {
        for component in p {
            // Vec<u8> writes cannot fail.
            payload.write_f32::<LittleEndian>(*component).unwrap();
        }
    }
    for c in &cloud.colors {
        payload.extend_from_slice(c);
    }

    let mut out = Vec::with_capacity(8 + payload.len());
    out.extend_from_slice(&FRAME_MAGIC);
    out.write_u32::<LittleEndian>(points as u32).unwrap();
    out.extend_from_slice(&lz4_flex::block::compress_prepend_size(&payload));
    out
}
