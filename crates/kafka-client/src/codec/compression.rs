use crate::{Compression, Error, Result};
use std::io::{Read, Write};

// Header of snappy payloads written by the JVM client's xerial framing.
const XERIAL_MAGIC: &[u8] = b"\x82SNAPPY\x00";

/// Compress a record batch payload with `codec`.
pub fn compress(codec: Compression, payload: &[u8]) -> Result<Vec<u8>> {
    let out = match codec {
        Compression::None => payload.to_vec(),
        Compression::Gzip => {
            let mut enc = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
            enc.write_all(payload).map_err(codec_io)?;
            enc.finish().map_err(codec_io)?
        }
        Compression::Snappy => snap::raw::Encoder::new()
            .compress_vec(payload)
            .map_err(|err| Error::CorruptMessage(format!("snappy: {err}")))?,
        Compression::Lz4 => {
            let mut enc = lz4_flex::frame::FrameEncoder::new(Vec::new());
            enc.write_all(payload).map_err(codec_io)?;
            enc.finish()
                .map_err(|err| Error::CorruptMessage(format!("lz4: {err}")))?
        }
        Compression::Zstd => zstd::stream::encode_all(payload, 3).map_err(codec_io)?,
    };
    Ok(out)
}

/// Decompress a record batch payload which was compressed with `codec`.
pub fn decompress(codec: Compression, payload: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(payload.len() * 2);

    match codec {
        Compression::None => out.extend_from_slice(payload),
        Compression::Gzip => {
            flate2::read::GzDecoder::new(payload)
                .read_to_end(&mut out)
                .map_err(codec_io)?;
        }
        Compression::Snappy if payload.starts_with(XERIAL_MAGIC) => {
            out = decompress_xerial(payload)?;
        }
        Compression::Snappy => {
            out = snap::raw::Decoder::new()
                .decompress_vec(payload)
                .map_err(|err| Error::CorruptMessage(format!("snappy: {err}")))?;
        }
        Compression::Lz4 => {
            lz4_flex::frame::FrameDecoder::new(payload)
                .read_to_end(&mut out)
                .map_err(codec_io)?;
        }
        Compression::Zstd => {
            out = zstd::stream::decode_all(payload).map_err(codec_io)?;
        }
    }
    Ok(out)
}

// Xerial framing: magic, two i32 versions, then blocks of (i32 length, raw snappy).
fn decompress_xerial(payload: &[u8]) -> Result<Vec<u8>> {
    let mut rest = &payload[XERIAL_MAGIC.len()..];
    if rest.len() < 8 {
        return Err(Error::CorruptMessage("truncated xerial snappy header".to_string()));
    }
    rest = &rest[8..];

    let mut decoder = snap::raw::Decoder::new();
    let mut out = Vec::new();

    while !rest.is_empty() {
        if rest.len() < 4 {
            return Err(Error::CorruptMessage("truncated xerial snappy block".to_string()));
        }
        let len = u32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]]) as usize;
        rest = &rest[4..];

        if rest.len() < len {
            return Err(Error::CorruptMessage("truncated xerial snappy block".to_string()));
        }
        let block = decoder
            .decompress_vec(&rest[..len])
            .map_err(|err| Error::CorruptMessage(format!("snappy: {err}")))?;
        out.extend_from_slice(&block);
        rest = &rest[len..];
    }
    Ok(out)
}

fn codec_io(err: std::io::Error) -> Error {
    Error::CorruptMessage(format!("compression codec: {err}"))
}
