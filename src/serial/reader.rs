use std::collections::HashMap;

use crate::error::{NetError, Result};
use crate::serial::tag::Tag;

const HEADER: usize = 8;

/// A borrowed tagged chunk: its tag and the raw bytes of its body.
#[derive(Debug, Clone, Copy)]
pub struct Chunk<'a> {
    tag: Tag,
    body: &'a [u8],
}

impl<'a> Chunk<'a> {
    /// Parses the outermost chunk of `data` and checks its tag.
    pub fn root(data: &'a [u8], expected: Tag) -> Result<Chunk<'a>> {
        let mut children = Children { rest: data };
        let root = children
            .next()
            .ok_or_else(|| NetError::format("empty file"))??;
        if root.tag != expected {
            return Err(NetError::format(format!(
                "unexpected root chunk {}, expected {expected}",
                root.tag
            )));
        }
        Ok(root)
    }

    pub fn tag(&self) -> Tag {
        self.tag
    }

    pub fn body(&self) -> &'a [u8] {
        self.body
    }

    /// Iterates the nested chunks of this chunk's body.
    pub fn children(&self) -> Children<'a> {
        Children { rest: self.body }
    }

    pub fn read_i32(&self) -> Result<i32> {
        let bytes: [u8; 4] = self.body.try_into().map_err(|_| self.bad_width(4))?;
        Ok(i32::from_le_bytes(bytes))
    }

    /// Reads a non-negative count or size.
    pub fn read_usize(&self) -> Result<usize> {
        let v = self.read_i32()?;
        usize::try_from(v)
            .map_err(|_| NetError::format(format!("negative value {v} in {}", self.tag)))
    }

    pub fn read_f64(&self) -> Result<f64> {
        let bytes: [u8; 8] = self.body.try_into().map_err(|_| self.bad_width(8))?;
        Ok(f64::from_le_bytes(bytes))
    }

    pub fn read_i32s(&self) -> Result<Vec<i32>> {
        if self.body.len() % 4 != 0 {
            return Err(self.bad_width(4));
        }
        Ok(self
            .body
            .chunks_exact(4)
            .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect())
    }

    pub fn read_f64s(&self) -> Result<Vec<f64>> {
        if self.body.len() % 8 != 0 {
            return Err(self.bad_width(8));
        }
        Ok(self
            .body
            .chunks_exact(8)
            .map(|c| {
                let mut b = [0u8; 8];
                b.copy_from_slice(c);
                f64::from_le_bytes(b)
            })
            .collect())
    }

    pub fn read_string(&self) -> Result<String> {
        String::from_utf8(self.body.to_vec())
            .map_err(|_| NetError::format(format!("{} is not valid UTF-8", self.tag)))
    }

    fn bad_width(&self, width: usize) -> NetError {
        NetError::format(format!(
            "{} holds {} bytes, not a multiple of {width}",
            self.tag,
            self.body.len()
        ))
    }
}

/// Iterator over sibling chunks. Yields an error once and then stops if the
/// remaining bytes cannot hold the announced chunk.
pub struct Children<'a> {
    rest: &'a [u8],
}

impl<'a> Iterator for Children<'a> {
    type Item = Result<Chunk<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.rest.is_empty() {
            return None;
        }
        if self.rest.len() < HEADER {
            let left = self.rest.len();
            self.rest = &[];
            return Some(Err(NetError::format(format!(
                "truncated chunk header ({left} bytes left)"
            ))));
        }
        let tag = Tag::from_bytes([self.rest[0], self.rest[1], self.rest[2], self.rest[3]]);
        let len = u32::from_le_bytes([self.rest[4], self.rest[5], self.rest[6], self.rest[7]]) as usize;
        let available = self.rest.len() - HEADER;
        if len > available {
            self.rest = &[];
            return Some(Err(NetError::format(format!(
                "chunk {tag} announces {len} bytes but only {available} remain"
            ))));
        }
        let body = &self.rest[HEADER..HEADER + len];
        self.rest = &self.rest[HEADER + len..];
        Some(Ok(Chunk { tag, body }))
    }
}

type Handler<'h, 'a> = Box<dyn FnMut(Chunk<'a>) -> Result<()> + 'h>;
type AnyHandler<'h, 'a> = Box<dyn FnMut(Tag, Chunk<'a>) -> Result<()> + 'h>;

/// Tag-to-handler table for one chunk scope.
///
/// `execute` walks the scope's children once, handing each to the handler
/// registered for its tag. Children without a handler go to the `on_any`
/// fallback when one is set and are skipped otherwise.
#[derive(Default)]
pub struct Dispatch<'h, 'a> {
    handlers: HashMap<Tag, Handler<'h, 'a>>,
    any: Option<AnyHandler<'h, 'a>>,
}

impl<'h, 'a> Dispatch<'h, 'a> {
    pub fn new() -> Self {
        Dispatch {
            handlers: HashMap::new(),
            any: None,
        }
    }

    pub fn on<F>(mut self, tag: Tag, handler: F) -> Self
    where
        F: FnMut(Chunk<'a>) -> Result<()> + 'h,
    {
        self.handlers.insert(tag, Box::new(handler));
        self
    }

    pub fn on_any<F>(mut self, handler: F) -> Self
    where
        F: FnMut(Tag, Chunk<'a>) -> Result<()> + 'h,
    {
        self.any = Some(Box::new(handler));
        self
    }

    pub fn execute(mut self, scope: Chunk<'a>) -> Result<()> {
        for child in scope.children() {
            let child = child?;
            if let Some(handler) = self.handlers.get_mut(&child.tag) {
                handler(child)?;
            } else if let Some(any) = self.any.as_mut() {
                any(child.tag, child)?;
            }
        }
        Ok(())
    }
}

/// Unwraps a field every well-formed chunk of kind `scope` must carry.
pub fn required<T>(value: Option<T>, scope: Tag, field: Tag) -> Result<T> {
    value.ok_or_else(|| NetError::format(format!("{scope} chunk is missing {field}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serial::tag;
    use crate::serial::writer::ChunkWriter;

    fn sample() -> Vec<u8> {
        let mut w = ChunkWriter::new();
        w.begin(tag::NWRK);
        w.write_i32(tag::ICNT, 3).unwrap();
        w.write_str(tag::NAME, "hidden").unwrap();
        w.write_f64s(tag::WGHT, &[1.5, -2.0]).unwrap();
        w.write_i32(Tag::new(b"ZZZZ"), 99).unwrap();
        w.end().unwrap();
        w.finish().unwrap()
    }

    #[test]
    fn dispatch_routes_by_tag_and_skips_unknown() {
        let data = sample();
        let root = Chunk::root(&data, tag::NWRK).unwrap();
        let mut count = None;
        let mut name = None;
        let mut weights = None;
        Dispatch::new()
            .on(tag::ICNT, |c| {
                count = Some(c.read_i32()?);
                Ok(())
            })
            .on(tag::NAME, |c| {
                name = Some(c.read_string()?);
                Ok(())
            })
            .on(tag::WGHT, |c| {
                weights = Some(c.read_f64s()?);
                Ok(())
            })
            .execute(root)
            .unwrap();
        assert_eq!(count, Some(3));
        assert_eq!(name.as_deref(), Some("hidden"));
        assert_eq!(weights, Some(vec![1.5, -2.0]));
    }

    #[test]
    fn fallback_sees_unmatched_tags_in_order() {
        let data = sample();
        let root = Chunk::root(&data, tag::NWRK).unwrap();
        let mut seen = Vec::new();
        Dispatch::new()
            .on(tag::ICNT, |_| Ok(()))
            .on_any(|t, _| {
                seen.push(t.to_string());
                Ok(())
            })
            .execute(root)
            .unwrap();
        assert_eq!(seen, vec!["NAME", "WGHT", "ZZZZ"]);
    }

    #[test]
    fn wrong_root_and_truncation_are_format_errors() {
        let data = sample();
        assert!(matches!(Chunk::root(&data, tag::LYRS), Err(NetError::Format(_))));
        let cut = &data[..data.len() - 3];
        assert!(matches!(Chunk::root(cut, tag::NWRK), Err(NetError::Format(_))));
        assert!(matches!(Chunk::root(&[], tag::NWRK), Err(NetError::Format(_))));
    }

    #[test]
    fn scalar_width_is_checked() {
        let mut w = ChunkWriter::new();
        w.write_f64(tag::RATE, 0.5).unwrap();
        let data = w.finish().unwrap();
        let chunk = Chunk::root(&data, tag::RATE).unwrap();
        assert_eq!(chunk.read_f64().unwrap(), 0.5);
        assert!(chunk.read_i32().is_err());
    }
}
