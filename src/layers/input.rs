use crate::error::{NetError, Result};
use crate::layers::{Layer, LoadedLayer};
use crate::math::matrix::{self, Matrix};
use crate::serial::{required, tag, Chunk, ChunkWriter, Dispatch};

/// Entry point of a graph. Holds no weights; its buffer is written by the
/// container before each pass.
#[derive(Debug, Clone)]
pub struct InputLayer {
    size: usize,
}

impl InputLayer {
    pub fn new(size: usize) -> InputLayer {
        InputLayer { size }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Augments raw feature rows, checking their count.
    pub fn make_raw_input(&self, data: &Matrix) -> Result<Matrix> {
        if data.nrows() != self.size {
            return Err(NetError::shape("input features", self.size, data.nrows()));
        }
        Ok(matrix::augment(data))
    }

    /// Checks an already augmented buffer before it replaces the output.
    pub fn check_raw(&self, data: &Matrix) -> Result<()> {
        if data.nrows() != self.size + 1 {
            return Err(NetError::shape("raw input rows", self.size + 1, data.nrows()));
        }
        Ok(())
    }

    pub(crate) fn save(&self, w: &mut ChunkWriter) -> Result<()> {
        w.write_i32(tag::ICNT, self.size as i32)
    }

    pub(crate) fn load(chunk: Chunk<'_>) -> Result<LoadedLayer> {
        let mut name = None;
        let mut size = None;
        Dispatch::new()
            .on(tag::NAME, |c| {
                name = Some(c.read_string()?);
                Ok(())
            })
            .on(tag::ICNT, |c| {
                size = Some(c.read_usize()?);
                Ok(())
            })
            .execute(chunk)?;
        Ok(LoadedLayer {
            layer: Layer::Input(InputLayer::new(required(size, tag::INPT, tag::ICNT)?)),
            name,
            links: Vec::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn raw_input_is_augmented_and_checked() {
        let input = InputLayer::new(2);
        let raw = input.make_raw_input(&array![[1.0, 0.0], [0.0, 1.0]]).unwrap();
        assert_eq!(raw, array![[1.0, 0.0], [0.0, 1.0], [1.0, 1.0]]);
        assert!(input.check_raw(&raw).is_ok());
        assert!(matches!(
            input.make_raw_input(&array![[1.0]]),
            Err(NetError::ShapeMismatch { expected: 2, found: 1, .. })
        ));
    }
}
