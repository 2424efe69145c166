use std::fmt;

/// Four ASCII bytes naming a chunk.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Tag([u8; 4]);

impl Tag {
    pub const fn new(name: &[u8; 4]) -> Tag {
        Tag(*name)
    }

    pub fn from_bytes(bytes: [u8; 4]) -> Tag {
        Tag(bytes)
    }

    pub fn bytes(&self) -> [u8; 4] {
        self.0
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for &b in &self.0 {
            if b.is_ascii_graphic() {
                write!(f, "{}", b as char)?;
            } else {
                write!(f, "\\x{b:02x}")?;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tag({self})")
    }
}

// Container chunks.
pub const NWRK: Tag = Tag::new(b"NWRK");
pub const LYRS: Tag = Tag::new(b"LYRS");
pub const OUTP: Tag = Tag::new(b"OUTP");

// Layer kinds.
pub const INPT: Tag = Tag::new(b"INPT");
pub const DENS: Tag = Tag::new(b"DENS");
pub const ACTV: Tag = Tag::new(b"ACTV");
pub const ADDR: Tag = Tag::new(b"ADDR");
pub const MULP: Tag = Tag::new(b"MULP");
pub const CMBN: Tag = Tag::new(b"CMBN");
pub const RNN_START: Tag = Tag::new(b"RNNs");
pub const RNN_END: Tag = Tag::new(b"RNNe");

// Scalar fields. Some share a name with a layer kind; meaning is scoped by
// the enclosing chunk.
pub const NAME: Tag = Tag::new(b"NAME");
pub const ICNT: Tag = Tag::new(b"ICNT");
pub const RCNT: Tag = Tag::new(b"RCNT");
pub const ROWS: Tag = Tag::new(b"ROWS");
pub const COLS: Tag = Tag::new(b"COLS");
pub const WGHT: Tag = Tag::new(b"WGHT");
pub const RATE: Tag = Tag::new(b"RATE");
pub const MMNT: Tag = Tag::new(b"MMNT");
pub const RMSP: Tag = Tag::new(b"RMSP");
pub const DRPT: Tag = Tag::new(b"DRPT");
pub const WDCY: Tag = Tag::new(b"WDCY");
pub const TRNS: Tag = Tag::new(b"TRNS");
pub const OUTC: Tag = Tag::new(b"OUTC");
pub const INPC: Tag = Tag::new(b"INPC");
pub const RINP: Tag = Tag::new(b"RINP");
pub const TYPE: Tag = Tag::new(b"TYPE");
pub const LAST: Tag = Tag::new(b"LAST");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_escapes_non_ascii() {
        assert_eq!(RNN_START.to_string(), "RNNs");
        assert_eq!(Tag::from_bytes([b'A', 0, b'B', b'C']).to_string(), "A\\x00BC");
    }
}
