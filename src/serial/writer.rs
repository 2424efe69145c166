use crate::error::{NetError, Result};
use crate::serial::tag::Tag;

/// Streams nested tagged chunks into a byte buffer.
///
/// `begin` writes the tag and reserves the length field; `end` backpatches it
/// once the chunk's children are written.
#[derive(Debug, Default)]
pub struct ChunkWriter {
    buf: Vec<u8>,
    open: Vec<usize>,
}

impl ChunkWriter {
    pub fn new() -> ChunkWriter {
        ChunkWriter::default()
    }

    pub fn begin(&mut self, tag: Tag) {
        self.buf.extend_from_slice(&tag.bytes());
        self.open.push(self.buf.len());
        self.buf.extend_from_slice(&0u32.to_le_bytes());
    }

    pub fn end(&mut self) -> Result<()> {
        let at = self
            .open
            .pop()
            .ok_or_else(|| NetError::format("chunk end without matching begin"))?;
        let len = self.buf.len() - at - 4;
        let len = u32::try_from(len)
            .map_err(|_| NetError::format(format!("chunk of {len} bytes exceeds u32 length")))?;
        self.buf[at..at + 4].copy_from_slice(&len.to_le_bytes());
        Ok(())
    }

    /// Writes a leaf chunk holding `bytes` verbatim.
    pub fn write_bytes(&mut self, tag: Tag, bytes: &[u8]) -> Result<()> {
        self.begin(tag);
        self.buf.extend_from_slice(bytes);
        self.end()
    }

    pub fn write_i32(&mut self, tag: Tag, value: i32) -> Result<()> {
        self.write_bytes(tag, &value.to_le_bytes())
    }

    pub fn write_f64(&mut self, tag: Tag, value: f64) -> Result<()> {
        self.write_bytes(tag, &value.to_le_bytes())
    }

    pub fn write_i32s(&mut self, tag: Tag, values: &[i32]) -> Result<()> {
        self.begin(tag);
        for v in values {
            self.buf.extend_from_slice(&v.to_le_bytes());
        }
        self.end()
    }

    pub fn write_f64s<'v>(&mut self, tag: Tag, values: impl IntoIterator<Item = &'v f64>) -> Result<()> {
        self.begin(tag);
        for v in values {
            self.buf.extend_from_slice(&v.to_le_bytes());
        }
        self.end()
    }

    pub fn write_str(&mut self, tag: Tag, value: &str) -> Result<()> {
        self.write_bytes(tag, value.as_bytes())
    }

    /// Returns the finished buffer; every chunk must be closed.
    pub fn finish(self) -> Result<Vec<u8>> {
        if !self.open.is_empty() {
            return Err(NetError::format(format!("{} chunk(s) left open", self.open.len())));
        }
        Ok(self.buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serial::tag;

    #[test]
    fn lengths_are_backpatched() {
        let mut w = ChunkWriter::new();
        w.begin(tag::NWRK);
        w.write_i32(tag::ICNT, 7).unwrap();
        w.end().unwrap();
        let bytes = w.finish().unwrap();
        assert_eq!(&bytes[0..4], b"NWRK");
        assert_eq!(u32::from_le_bytes(bytes[4..8].try_into().unwrap()), 12);
        assert_eq!(&bytes[8..12], b"ICNT");
        assert_eq!(u32::from_le_bytes(bytes[12..16].try_into().unwrap()), 4);
        assert_eq!(i32::from_le_bytes(bytes[16..20].try_into().unwrap()), 7);
    }

    #[test]
    fn unbalanced_chunks_are_rejected() {
        let mut w = ChunkWriter::new();
        assert!(w.end().is_err());
        w.begin(tag::LYRS);
        assert!(w.finish().is_err());
    }
}
