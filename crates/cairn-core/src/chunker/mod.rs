use std::io::Read;

use crate::config::ChunkerConfig;

/// Fixed-size chunker over a readable byte stream of known length.
///
/// Yields `(offset, bytes)` pairs with contiguous offsets starting at 0.
/// Files shorter than `min_chunkable` come out as exactly one chunk, so
/// small files cost a single object; an empty stream yields nothing.
/// Boundaries depend only on the length, keeping chunking deterministic.
pub struct FixedChunker<R: Read> {
    reader: R,
    chunk_size: usize,
    offset: u64,
    failed: bool,
}

impl<R: Read> FixedChunker<R> {
    pub fn new(reader: R, total_len: u64, config: &ChunkerConfig) -> Self {
        let chunk_size = if total_len < config.min_chunkable {
            // Single-chunk bypass: read the whole file in one piece.
            total_len.max(1) as usize
        } else {
            config.chunk_size.max(1) as usize
        };
        Self {
            reader,
            chunk_size,
            offset: 0,
            failed: false,
        }
    }

    fn read_chunk(&mut self) -> std::io::Result<Vec<u8>> {
        let mut buf = vec![0u8; self.chunk_size];
        let mut filled = 0;
        while filled < buf.len() {
            match self.reader.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        buf.truncate(filled);
        Ok(buf)
    }
}

impl<R: Read> Iterator for FixedChunker<R> {
    type Item = std::io::Result<(u64, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        match self.read_chunk() {
            Ok(data) if data.is_empty() => None,
            Ok(data) => {
                let offset = self.offset;
                self.offset += data.len() as u64;
                Some(Ok((offset, data)))
            }
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn config(chunk_size: u64, min_chunkable: u64) -> ChunkerConfig {
        ChunkerConfig {
            chunk_size,
            min_chunkable,
        }
    }

    fn chunks_of(data: &[u8], cfg: &ChunkerConfig) -> Vec<(u64, Vec<u8>)> {
        FixedChunker::new(Cursor::new(data.to_vec()), data.len() as u64, cfg)
            .collect::<std::io::Result<Vec<_>>>()
            .unwrap()
    }

    #[test]
    fn empty_input_yields_no_chunks() {
        assert!(chunks_of(b"", &config(4, 16)).is_empty());
    }

    #[test]
    fn below_min_chunkable_is_one_chunk() {
        let data = vec![0xAB; 15];
        let chunks = chunks_of(&data, &config(4, 16));
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].0, 0);
        assert_eq!(chunks[0].1, data);
    }

    #[test]
    fn exactly_chunk_size_is_one_chunk() {
        let data = vec![1u8; 8];
        let chunks = chunks_of(&data, &config(8, 8));
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].1.len(), 8);
    }

    #[test]
    fn chunk_size_plus_one_is_two_chunks() {
        let data = vec![1u8; 9];
        let chunks = chunks_of(&data, &config(8, 8));
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].1.len(), 8);
        assert_eq!(chunks[1], (8, vec![1u8]));
    }

    #[test]
    fn offsets_are_contiguous() {
        let data: Vec<u8> = (0..100u8).collect();
        let chunks = chunks_of(&data, &config(7, 7));
        let mut expected_offset = 0u64;
        let mut reassembled = Vec::new();
        for (offset, chunk) in &chunks {
            assert_eq!(*offset, expected_offset);
            expected_offset += chunk.len() as u64;
            reassembled.extend_from_slice(chunk);
        }
        assert_eq!(reassembled, data);
    }

    #[test]
    fn boundaries_are_deterministic() {
        let data = vec![0x5A; 1000];
        let cfg = config(64, 128);
        assert_eq!(chunks_of(&data, &cfg), chunks_of(&data, &cfg));
    }
}
