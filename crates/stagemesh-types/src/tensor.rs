// Host-side dense tensors exchanged between pipeline stages.

use serde::{Deserialize, Serialize};

use crate::error::{Result, TypesError};

// ── Tensor ────────────────────────────────────────────────────────────────────

/// Row-major `f32` array with an explicit shape.
///
/// A rank-0 tensor (`shape == []`) holds exactly one element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
    shape: Vec<usize>,
    data: Vec<f32>,
}

impl Tensor {
    /// Build a tensor, checking that `data` fills `shape` exactly.
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> Result<Self> {
        let numel = numel(&shape);
        if data.len() != numel {
            return Err(TypesError::Shape(format!(
                "shape {shape:?} needs {numel} elements, got {}",
                data.len()
            )));
        }
        Ok(Self { shape, data })
    }

    pub fn zeros(shape: &[usize]) -> Self {
        Self {
            shape: shape.to_vec(),
            data: vec![0.0; numel(shape)],
        }
    }

    pub fn scalar(value: f32) -> Self {
        Self {
            shape: Vec::new(),
            data: vec![value],
        }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn into_data(self) -> Vec<f32> {
        self.data
    }

    pub fn numel(&self) -> usize {
        self.data.len()
    }

    pub fn size_bytes(&self) -> u64 {
        (self.data.len() * std::mem::size_of::<f32>()) as u64
    }

    /// Split along axis 0 into `parts` equally sized tensors.
    pub fn split_batch(&self, parts: usize) -> Result<Vec<Tensor>> {
        let Some(&rows) = self.shape.first() else {
            return Err(TypesError::Shape(
                "cannot split a rank-0 tensor into micro-batches".into(),
            ));
        };
        if parts == 0 || rows % parts != 0 {
            return Err(TypesError::Shape(format!(
                "batch dimension {rows} is not divisible into {parts} micro-batches"
            )));
        }

        let rows_per_part = rows / parts;
        let chunk = rows_per_part * numel(&self.shape[1..]);
        let mut part_shape = self.shape.clone();
        part_shape[0] = rows_per_part;

        Ok((0..parts)
            .map(|p| Tensor {
                shape: part_shape.clone(),
                data: self.data[p * chunk..(p + 1) * chunk].to_vec(),
            })
            .collect())
    }

    /// Largest absolute element-wise difference. Shapes must match.
    pub fn max_abs_diff(&self, other: &Tensor) -> Result<f32> {
        if self.shape != other.shape {
            return Err(TypesError::Shape(format!(
                "cannot compare {:?} with {:?}",
                self.shape, other.shape
            )));
        }
        Ok(self
            .data
            .iter()
            .zip(&other.data)
            .map(|(a, b)| (a - b).abs())
            .fold(0.0, f32::max))
    }
}

/// Number of elements described by a shape.
pub fn numel(shape: &[usize]) -> usize {
    shape.iter().product()
}

// ── Tests ─────────────────────────────────────────────────────────────────────
