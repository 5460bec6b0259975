//! Host-side tensor values exchanged through the aggregation pipeline.
//!
//! A tensor of shape `[d0, d1, ..]` is viewed as a column-major matrix with
//! `rows = d0` and `cols = numel / d0`. Column `c` occupies the contiguous
//! element range `[c * rows, (c + 1) * rows)`. Sparse block-column tensors
//! store only a sorted set of whole columns.

use std::collections::BTreeMap;
use std::ops::Range;

use crate::element::{add_slice, encode_f64s, read_f64s, write_f64s};
use crate::error::{QdpError, Result};
use crate::types::{DataType, Device, StorageFormat};

#[derive(Debug, Clone, PartialEq)]
enum Layout {
    Dense,
    SparseBlockColumn { columns: Vec<u32> },
}

/// A shaped, typed tensor with little-endian element storage.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    shape: Vec<usize>,
    dtype: DataType,
    device: Device,
    layout: Layout,
    data: Vec<u8>,
}

impl Tensor {
    /// Dense all-zero tensor.
    pub fn zeros(shape: &[usize], dtype: DataType, device: Device) -> Self {
        let numel: usize = shape.iter().product();
        Self {
            shape: shape.to_vec(),
            dtype,
            device,
            layout: Layout::Dense,
            data: vec![0u8; numel * dtype.size_in_bytes()],
        }
    }

    /// Dense tensor from column-major values.
    pub fn from_f64s(
        shape: &[usize],
        values: &[f64],
        dtype: DataType,
        device: Device,
    ) -> Result<Self> {
        let mut t = Self::zeros(shape, dtype, device);
        t.set_f64s(values)?;
        Ok(t)
    }

    /// Dense `F32` tensor from column-major values.
    pub fn from_f32s(shape: &[usize], values: &[f32], device: Device) -> Result<Self> {
        let widened: Vec<f64> = values.iter().map(|&v| v as f64).collect();
        Self::from_f64s(shape, &widened, DataType::F32, device)
    }

    /// `[1]`-shaped `F64` CPU tensor.
    pub fn scalar(value: f64) -> Self {
        Self {
            shape: vec![1],
            dtype: DataType::F64,
            device: Device::Cpu,
            layout: Layout::Dense,
            data: value.to_le_bytes().to_vec(),
        }
    }

    /// Sparse block-column tensor with no stored columns.
    pub fn empty_sparse(shape: &[usize], dtype: DataType, device: Device) -> Self {
        Self {
            shape: shape.to_vec(),
            dtype,
            device,
            layout: Layout::SparseBlockColumn {
                columns: Vec::new(),
            },
            data: Vec::new(),
        }
    }

    /// Sparse block-column tensor from `(column, values)` pairs.
    ///
    /// Columns may be given in any order but must be unique and in range;
    /// each must carry exactly `rows` values.
    pub fn sparse_block_column(
        shape: &[usize],
        dtype: DataType,
        device: Device,
        columns: Vec<(u32, Vec<f64>)>,
    ) -> Result<Self> {
        let mut t = Self::empty_sparse(shape, dtype, device);
        let mut sorted: BTreeMap<u32, Vec<f64>> = BTreeMap::new();
        for (col, values) in columns {
            if sorted.insert(col, values).is_some() {
                return Err(QdpError::unsupported(
                    "sparse_block_column",
                    format!("column {col} given twice"),
                ));
            }
        }
        t.set_sparse_columns(sorted)?;
        Ok(t)
    }

    /// Tensor of the same shape, type, device and format holding zeros.
    pub fn zeros_like(&self) -> Self {
        match self.layout {
            Layout::Dense => Self::zeros(&self.shape, self.dtype, self.device),
            Layout::SparseBlockColumn { .. } => {
                Self::empty_sparse(&self.shape, self.dtype, self.device)
            }
        }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn dtype(&self) -> DataType {
        self.dtype
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn format(&self) -> StorageFormat {
        match self.layout {
            Layout::Dense => StorageFormat::Dense,
            Layout::SparseBlockColumn { .. } => StorageFormat::SparseBlockColumn,
        }
    }

    /// Number of logical elements.
    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }

    /// Number of dimensions.
    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// Leading dimension of the matrix view.
    pub fn rows(&self) -> usize {
        matrix_rows(&self.shape)
    }

    /// Column count of the matrix view.
    pub fn cols(&self) -> usize {
        matrix_cols(&self.shape)
    }

    /// Element range covering `cols` in the dense column-major layout.
    pub fn column_span(&self, cols: Range<usize>) -> Range<usize> {
        let rows = self.rows();
        cols.start * rows..cols.end * rows
    }

    /// Stored columns of a sparse block-column tensor.
    pub fn sparse_columns(&self) -> Option<&[u32]> {
        match &self.layout {
            Layout::Dense => None,
            Layout::SparseBlockColumn { columns } => Some(columns),
        }
    }

    /// Raw stored element bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Raw stored element bytes, mutable. The length cannot change.
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Stored values widened to `f64` (only the present columns for sparse tensors).
    pub fn stored_f64s(&self) -> Result<Vec<f64>> {
        read_f64s(&self.data, self.dtype)
    }

    /// All logical values, column-major, widened to `f64`.
    pub fn to_f64s(&self) -> Result<Vec<f64>> {
        let stored = self.stored_f64s()?;
        match &self.layout {
            Layout::Dense => Ok(stored),
            Layout::SparseBlockColumn { columns } => {
                let rows = self.rows();
                let mut dense = vec![0.0; self.numel()];
                for (i, &col) in columns.iter().enumerate() {
                    let dst = col as usize * rows;
                    dense[dst..dst + rows].copy_from_slice(&stored[i * rows..(i + 1) * rows]);
                }
                Ok(dense)
            }
        }
    }

    /// Overwrite every element of a dense tensor.
    pub fn set_f64s(&mut self, values: &[f64]) -> Result<()> {
        if self.layout != Layout::Dense {
            return Err(QdpError::unsupported(
                "set_f64s",
                "tensor is sparse block-column",
            ));
        }
        if values.len() != self.numel() {
            return Err(QdpError::ShapeMismatch {
                operation: "set_f64s",
                expected: self.shape.clone(),
                actual: vec![values.len()],
            });
        }
        write_f64s(values, &mut self.data, self.dtype)
    }

    /// Replace the stored columns of a sparse block-column tensor.
    pub fn set_sparse_columns(&mut self, columns: BTreeMap<u32, Vec<f64>>) -> Result<()> {
        let rows = self.rows();
        let cols = self.cols();
        let Layout::SparseBlockColumn { .. } = self.layout else {
            return Err(QdpError::unsupported(
                "set_sparse_columns",
                "tensor is dense",
            ));
        };

        let mut ids = Vec::with_capacity(columns.len());
        let mut values = Vec::with_capacity(columns.len() * rows);
        for (col, column) in columns {
            if col as usize >= cols {
                return Err(QdpError::ShapeMismatch {
                    operation: "set_sparse_columns",
                    expected: self.shape.clone(),
                    actual: vec![rows, col as usize + 1],
                });
            }
            if column.len() != rows {
                return Err(QdpError::ShapeMismatch {
                    operation: "set_sparse_columns",
                    expected: vec![rows],
                    actual: vec![column.len()],
                });
            }
            ids.push(col);
            values.extend_from_slice(&column);
        }

        self.data = encode_f64s(&values, self.dtype)?;
        self.layout = Layout::SparseBlockColumn { columns: ids };
        Ok(())
    }

    /// Stored columns of a sparse tensor keyed by column index.
    pub fn sparse_column_map(&self) -> Result<BTreeMap<u32, Vec<f64>>> {
        let Some(columns) = self.sparse_columns() else {
            return Err(QdpError::unsupported(
                "sparse_column_map",
                "tensor is dense",
            ));
        };
        let rows = self.rows();
        let stored = self.stored_f64s()?;
        Ok(columns
            .iter()
            .enumerate()
            .map(|(i, &col)| (col, stored[i * rows..(i + 1) * rows].to_vec()))
            .collect())
    }

    /// Reset every element to zero. Sparse tensors drop all stored columns.
    pub fn set_zero(&mut self) {
        match &mut self.layout {
            Layout::Dense => self.data.fill(0),
            Layout::SparseBlockColumn { columns } => {
                columns.clear();
                self.data.clear();
            }
        }
    }

    /// True when every logical element is zero.
    pub fn is_zero(&self) -> Result<bool> {
        Ok(self.stored_f64s()?.iter().all(|&v| v == 0.0))
    }

    /// `self += other`. Both tensors must agree in shape, type and format.
    pub fn add_assign(&mut self, other: &Tensor) -> Result<()> {
        if self.shape != other.shape {
            return Err(QdpError::ShapeMismatch {
                operation: "add_assign",
                expected: self.shape.clone(),
                actual: other.shape.clone(),
            });
        }
        if self.dtype != other.dtype {
            return Err(QdpError::UnsupportedDType {
                dtype: other.dtype,
                op: "add_assign",
            });
        }
        match (&self.layout, &other.layout) {
            (Layout::Dense, Layout::Dense) => {
                let count = self.numel();
                let dtype = self.dtype;
                add_slice(&mut self.data, &other.data, count, dtype)
            }
            (Layout::SparseBlockColumn { .. }, Layout::SparseBlockColumn { .. }) => {
                let mut merged = self.sparse_column_map()?;
                for (col, values) in other.sparse_column_map()? {
                    match merged.get_mut(&col) {
                        Some(existing) => {
                            for (e, v) in existing.iter_mut().zip(values) {
                                *e += v;
                            }
                        }
                        None => {
                            merged.insert(col, values);
                        }
                    }
                }
                self.set_sparse_columns(merged)
            }
            _ => Err(QdpError::unsupported(
                "add_assign",
                "cannot mix dense and sparse block-column tensors",
            )),
        }
    }
}

/// Leading dimension of the column-major matrix view of `shape`.
pub fn matrix_rows(shape: &[usize]) -> usize {
    shape.first().copied().unwrap_or(1)
}

/// Column count of the column-major matrix view of `shape`.
pub fn matrix_cols(shape: &[usize]) -> usize {
    let rows = matrix_rows(shape);
    if rows == 0 {
        0
    } else {
        shape.iter().product::<usize>() / rows
    }
}
