//! Rank-agnostic tensor container for model inputs and outputs.

use crate::error::{FaceError, Result};
use ndarray::{Array, ArrayD, ArrayViewD, Dimension, IxDyn};
use std::borrow::Cow;

/// A dense `f32` tensor of any rank.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    array: ArrayD<f32>,
}

impl Tensor {
    /// Build a tensor from a shape and a row-major buffer.
    pub fn from_shape_vec(shape: &[usize], data: Vec<f32>) -> Result<Self> {
        let expected: usize = shape.iter().product();
        if expected != data.len() {
            return Err(FaceError::DecodeFailure(format!(
                "tensor shape {shape:?} needs {expected} values, got {}",
                data.len()
            )));
        }
        let array = ArrayD::from_shape_vec(IxDyn(shape), data)
            .map_err(|e| FaceError::DecodeFailure(format!("tensor shape {shape:?}: {e}")))?;
        Ok(Self { array })
    }

    pub fn shape(&self) -> &[usize] {
        self.array.shape()
    }

    pub fn len(&self) -> usize {
        self.array.len()
    }

    pub fn is_empty(&self) -> bool {
        self.array.is_empty()
    }

    pub fn view(&self) -> ArrayViewD<'_, f32> {
        self.array.view()
    }

    /// Row-major flattening, independent of rank.
    ///
    /// Borrows when the storage is already in standard layout.
    pub fn flatten(&self) -> Cow<'_, [f32]> {
        match self.array.as_slice() {
            Some(slice) => Cow::Borrowed(slice),
            None => Cow::Owned(self.array.iter().copied().collect()),
        }
    }
}

impl<D: Dimension> From<Array<f32, D>> for Tensor {
    fn from(array: Array<f32, D>) -> Self {
        Self { array: array.into_dyn() }
    }
}
