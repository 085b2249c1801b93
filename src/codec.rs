//! Chunk blob compression: a raw zlib stream at the dataset's
//! configured deflate level.

use std::io::{Read, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;

use crate::error::{ServiceError, ServiceResult};

pub fn deflate(data: &[u8], level: u32) -> ServiceResult<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::new(level.min(9)));
    encoder
        .write_all(data)
        .and_then(|_| encoder.finish())
        .map_err(|err| ServiceError::Internal(format!("deflate failed: {}", err)))
}

pub fn inflate(data: &[u8]) -> ServiceResult<Vec<u8>> {
    let mut decoder = ZlibDecoder::new(data);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|err| ServiceError::Internal(format!("inflate failed: {}", err)))?;
    Ok(out)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_round_trip() {
        let data: Vec<u8> = (0..200u8).cycle().take(10_000).collect();
        for level in &[1u32, 5, 9] {
            let packed = deflate(&data, *level).unwrap();
            assert!(packed.len() < data.len());
            assert_eq!(inflate(&packed).unwrap(), data);
        }
    }

    #[test]
    fn test_inflate_rejects_garbage() {
        assert!(inflate(b"not a zlib stream").is_err());
    }
}
