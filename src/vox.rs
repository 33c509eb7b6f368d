//! PISV scene file reader and writer.
//!
//! A scene is a dense voxel volume plus a 256-entry RGBA material palette.
//! The on-disk layout is little-endian: an 8-byte magic/version tag, three
//! `u32` extents, a run-length stream of `{u16 length, u8 value}` pairs that
//! must produce exactly `x*y*z` bytes, a 4-byte palette tag (skipped), and
//! 256 four-byte RGBA entries.

use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::path::Path;

use thiserror::Error;

/// Exact magic/version tag opening every PISV scene file.
pub const PISV_MAGIC: &[u8; 8] = b"PISV 001";

/// Number of entries in a material palette, regardless of how many the
/// volume actually references.
pub const PALETTE_LEN: usize = 256;

const PALETTE_TAG_LEN: usize = 4;

#[derive(Debug, Error)]
pub enum FormatError {
    #[error("failed to read scene file")]
    Io(#[from] io::Error),
    #[error("not a PISV scene (magic {0:02x?})")]
    BadMagic([u8; 8]),
    #[error("volume extents {0}x{1}x{2} overflow the addressable size")]
    VolumeTooLarge(u32, u32, u32),
    #[error("zero-length run after {written} of {total} voxels")]
    ZeroRun { written: u32, total: u32 },
    #[error("run of {run} voxels overflows the volume at {written} of {total}")]
    RunOverflow { run: u16, written: u32, total: u32 },
}

/// Dense voxel grid. Each byte is an index into the scene's palette.
///
/// The backing array always holds exactly `width * height * depth` bytes;
/// decoding either fills it completely or fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoxelVolume {
    extent: [u32; 3],
    voxels: Vec<u8>,
}

impl VoxelVolume {
    pub fn new(extent: [u32; 3], voxels: Vec<u8>) -> Self {
        let total = extent.iter().map(|&e| e as usize).product::<usize>();
        assert_eq!(voxels.len(), total, "voxel array must match extents");
        Self { extent, voxels }
    }

    pub fn extent(&self) -> [u32; 3] {
        self.extent
    }

    pub fn voxels(&self) -> &[u8] {
        &self.voxels
    }

    /// Palette index at (x, y, z). Flat layout: `x + y*W + z*W*H`.
    pub fn get(&self, x: u32, y: u32, z: u32) -> u8 {
        let [w, h, _] = self.extent;
        self.voxels[(x + y * w + z * w * h) as usize]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rgba {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
}

impl Rgba {
    /// Packs to the u32 layout the palette buffer uses on the GPU
    /// (r in the low byte, matching the file's byte order on little-endian).
    pub fn pack(self) -> u32 {
        u32::from_le_bytes([self.r, self.g, self.b, self.a])
    }
}

/// Fixed 256-entry material table, preserved byte-for-byte from the file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaterialPalette {
    entries: Box<[Rgba; PALETTE_LEN]>,
}

impl MaterialPalette {
    pub fn new(entries: Box<[Rgba; PALETTE_LEN]>) -> Self {
        Self { entries }
    }

    pub fn entries(&self) -> &[Rgba; PALETTE_LEN] {
        &self.entries
    }

    pub fn packed(&self) -> Vec<u32> {
        self.entries.iter().map(|c| c.pack()).collect()
    }
}

/// Reads a whole scene from `path`. Any malformed content is fatal; there is
/// no partial volume.
pub fn decode_file(path: &Path) -> Result<(VoxelVolume, MaterialPalette), FormatError> {
    let mut reader = BufReader::new(File::open(path)?);
    decode(&mut reader)
}

pub fn decode<R: Read>(reader: &mut R) -> Result<(VoxelVolume, MaterialPalette), FormatError> {
    let mut magic = [0u8; 8];
    reader.read_exact(&mut magic)?;
    if &magic != PISV_MAGIC {
        return Err(FormatError::BadMagic(magic));
    }

    let mut buf4 = [0u8; 4];
    let mut extent = [0u32; 3];
    for e in &mut extent {
        reader.read_exact(&mut buf4)?;
        *e = u32::from_le_bytes(buf4);
    }
    let [x, y, z] = extent;
    let total = x
        .checked_mul(y)
        .and_then(|xy| xy.checked_mul(z))
        .ok_or(FormatError::VolumeTooLarge(x, y, z))?;

    let mut voxels = vec![0u8; total as usize];
    let mut written: u32 = 0;
    while written < total {
        let mut buf2 = [0u8; 2];
        reader.read_exact(&mut buf2)?;
        let run = u16::from_le_bytes(buf2);
        if run == 0 {
            // A zero run is only legal once the volume is full; mid-stream it
            // means the file is corrupt.
            return Err(FormatError::ZeroRun { written, total });
        }

        let mut value = [0u8; 1];
        reader.read_exact(&mut value)?;

        let end = written as usize + run as usize;
        if end > total as usize {
            return Err(FormatError::RunOverflow {
                run,
                written,
                total,
            });
        }
        voxels[written as usize..end].fill(value[0]);
        written += run as u32;
    }

    // Palette tag is present in every known writer but was never validated;
    // skip it.
    let mut tag = [0u8; PALETTE_TAG_LEN];
    reader.read_exact(&mut tag)?;

    let mut entries = Box::new([Rgba::default(); PALETTE_LEN]);
    let mut raw = [0u8; PALETTE_LEN * 4];
    reader.read_exact(&mut raw)?;
    for (entry, bytes) in entries.iter_mut().zip(raw.chunks_exact(4)) {
        *entry = Rgba {
            r: bytes[0],
            g: bytes[1],
            b: bytes[2],
            a: bytes[3],
        };
    }

    Ok((
        VoxelVolume::new(extent, voxels),
        MaterialPalette::new(entries),
    ))
}

/// Writes a scene in the PISV layout, emitting maximal runs.
pub fn encode<W: Write>(
    volume: &VoxelVolume,
    palette: &MaterialPalette,
    writer: &mut W,
) -> io::Result<()> {
    writer.write_all(PISV_MAGIC)?;
    for e in volume.extent() {
        writer.write_all(&e.to_le_bytes())?;
    }

    let voxels = volume.voxels();
    let mut pos = 0usize;
    while pos < voxels.len() {
        let value = voxels[pos];
        let mut run = 1u16;
        while pos + (run as usize) < voxels.len()
            && voxels[pos + run as usize] == value
            && run < u16::MAX
        {
            run += 1;
        }
        writer.write_all(&run.to_le_bytes())?;
        writer.write_all(&[value])?;
        pos += run as usize;
    }

    writer.write_all(b"PALT")?;
    for entry in palette.entries() {
        writer.write_all(&[entry.r, entry.g, entry.b, entry.a])?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_palette() -> MaterialPalette {
        let mut entries = Box::new([Rgba::default(); PALETTE_LEN]);
        for (i, e) in entries.iter_mut().enumerate() {
            *e = Rgba {
                r: i as u8,
                g: (i as u8).wrapping_mul(3),
                b: 255 - i as u8,
                a: 255,
            };
        }
        MaterialPalette::new(entries)
    }

    fn encode_scene(volume: &VoxelVolume, palette: &MaterialPalette) -> Vec<u8> {
        let mut buf = Vec::new();
        encode(volume, palette, &mut buf).unwrap();
        buf
    }

    #[test]
    fn round_trip_mixed_volume() {
        let mut voxels = vec![0u8; 4 * 3 * 2];
        voxels[0] = 7;
        voxels[5] = 7;
        voxels[6] = 7;
        voxels[23] = 200;
        let volume = VoxelVolume::new([4, 3, 2], voxels);
        let palette = test_palette();

        let buf = encode_scene(&volume, &palette);
        let (decoded, decoded_palette) = decode(&mut &buf[..]).unwrap();
        assert_eq!(decoded, volume);
        assert_eq!(decoded_palette, palette);
    }

    #[test]
    fn single_run_fills_volume() {
        let mut buf = Vec::new();
        buf.extend_from_slice(PISV_MAGIC);
        for e in [2u32, 2, 2] {
            buf.extend_from_slice(&e.to_le_bytes());
        }
        buf.extend_from_slice(&8u16.to_le_bytes());
        buf.push(5);
        buf.extend_from_slice(b"MATL");
        let palette_bytes: Vec<u8> = (0..PALETTE_LEN * 4).map(|i| i as u8).collect();
        buf.extend_from_slice(&palette_bytes);

        let (volume, palette) = decode(&mut &buf[..]).unwrap();
        assert_eq!(volume.extent(), [2, 2, 2]);
        assert!(volume.voxels().iter().all(|&v| v == 5));
        assert_eq!(volume.get(1, 1, 1), 5);

        // Palette content is arbitrary but must survive byte-for-byte.
        let mut round = Vec::new();
        for e in palette.entries() {
            round.extend_from_slice(&[e.r, e.g, e.b, e.a]);
        }
        assert_eq!(round, palette_bytes);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut buf = Vec::new();
        buf.extend_from_slice(b"PISV 002");
        buf.extend_from_slice(&[0u8; 12]);
        assert!(matches!(
            decode(&mut &buf[..]),
            Err(FormatError::BadMagic(_))
        ));
    }

    #[test]
    fn rejects_zero_run_before_volume_is_full() {
        let mut buf = Vec::new();
        buf.extend_from_slice(PISV_MAGIC);
        for e in [2u32, 2, 2] {
            buf.extend_from_slice(&e.to_le_bytes());
        }
        buf.extend_from_slice(&4u16.to_le_bytes());
        buf.push(1);
        buf.extend_from_slice(&0u16.to_le_bytes());
        assert!(matches!(
            decode(&mut &buf[..]),
            Err(FormatError::ZeroRun { written: 4, total: 8 })
        ));
    }

    #[test]
    fn rejects_stream_that_ends_early() {
        let mut buf = Vec::new();
        buf.extend_from_slice(PISV_MAGIC);
        for e in [4u32, 4, 4] {
            buf.extend_from_slice(&e.to_le_bytes());
        }
        buf.extend_from_slice(&16u16.to_le_bytes());
        buf.push(9);
        // Stream stops at 16 of 64 voxels; must fail, never return a short
        // volume.
        assert!(matches!(decode(&mut &buf[..]), Err(FormatError::Io(_))));
    }

    #[test]
    fn rejects_run_that_overflows_volume() {
        let mut buf = Vec::new();
        buf.extend_from_slice(PISV_MAGIC);
        for e in [2u32, 2, 2] {
            buf.extend_from_slice(&e.to_le_bytes());
        }
        buf.extend_from_slice(&9u16.to_le_bytes());
        buf.push(1);
        assert!(matches!(
            decode(&mut &buf[..]),
            Err(FormatError::RunOverflow { run: 9, .. })
        ));
    }

    #[test]
    fn rejects_truncated_palette() {
        let volume = VoxelVolume::new([2, 2, 1], vec![3; 4]);
        let mut buf = encode_scene(&volume, &test_palette());
        buf.truncate(buf.len() - 100);
        assert!(matches!(decode(&mut &buf[..]), Err(FormatError::Io(_))));
    }

    #[test]
    fn rejects_overflowing_extents() {
        let mut buf = Vec::new();
        buf.extend_from_slice(PISV_MAGIC);
        for e in [u32::MAX, 2, 2] {
            buf.extend_from_slice(&e.to_le_bytes());
        }
        assert!(matches!(
            decode(&mut &buf[..]),
            Err(FormatError::VolumeTooLarge(..))
        ));
    }
}
