/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use std::fs::File;
use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;

/// Write a zlib-framed blob: both size headers are reserved up front,
/// the payload is deflated straight into the file, and the headers are
/// back-patched once the compressed size is known.
pub fn write_blob(file: &mut File, payload: &[u8]) -> io::Result<()> {
    let header_pos = file.stream_position()?;
    file.write_u64::<LittleEndian>(0)?;
    file.write_u64::<LittleEndian>(0)?;

    let mut encoder = ZlibEncoder::new(&mut *file, Compression::default());
    encoder.write_all(payload)?;
    encoder.finish()?;

    let end_pos = file.stream_position()?;
    file.seek(SeekFrom::Start(header_pos))?;
    file.write_u64::<LittleEndian>(end_pos - header_pos - 16)?;
    file.write_u64::<LittleEndian>(payload.len() as u64)?;
    file.seek(SeekFrom::Start(end_pos))?;
    Ok(())
}

/// Read back a zlib-framed blob from an in-memory file image.
pub fn read_blob(bytes: &[u8]) -> io::Result<Vec<u8>> {
    let mut cursor = Cursor::new(bytes);
    let compressed_size = cursor.read_u64::<LittleEndian>()? as usize;
    let decompressed_size = cursor.read_u64::<LittleEndian>()? as usize;
    let start = cursor.position() as usize;
    let end = start
        .checked_add(compressed_size)
        .filter(|end| *end <= bytes.len())
        .ok_or_else(|| {
            io::Error::new(io::ErrorKind::UnexpectedEof, "compressed blob is truncated")
        })?;

    let mut payload = Vec::with_capacity(decompressed_size);
    ZlibDecoder::new(&bytes[start..end]).read_to_end(&mut payload)?;
    if payload.len() != decompressed_size {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!(
                "blob decompressed to {} byte(s), header says {}",
                payload.len(),
                decompressed_size
            ),
        ));
    }
    Ok(payload)
}
