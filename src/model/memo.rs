//! Exact-match memoization keyed by tensor contents.

use candle_core::{DType, Tensor};
use std::collections::HashMap;

use crate::error::DynamicsResult;

/// Value-semantics key over a tensor's dtype, shape and element bits.
///
/// Floating elements are widened to `f64` (lossless for every float dtype candle
/// stores) and integer elements to `i64`; the raw bit patterns are compared, so a
/// one-ulp perturbation is a different key. `-0.0` and `0.0` differ; a NaN equals
/// an identical NaN.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HashedTensor {
    dtype: &'static str,
    dims: Vec<usize>,
    bits: Vec<u64>,
}

impl HashedTensor {
    pub fn new(tensor: &Tensor) -> DynamicsResult<Self> {
        let flat = tensor.flatten_all()?;
        let bits = match tensor.dtype() {
            DType::U8 | DType::U32 | DType::I64 => flat
                .to_dtype(DType::I64)?
                .to_vec1::<i64>()?
                .into_iter()
                .map(|v| v as u64)
                .collect(),
            _ => flat
                .to_dtype(DType::F64)?
                .to_vec1::<f64>()?
                .into_iter()
                .map(f64::to_bits)
                .collect(),
        };
        Ok(Self {
            dtype: tensor.dtype().as_str(),
            dims: tensor.dims().to_vec(),
            bits,
        })
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    /// Number of rows, i.e. the product of every axis but the last.
    pub fn rows(&self) -> usize {
        match self.dims.split_last() {
            Some((_, leading)) => leading.iter().product(),
            None => 1,
        }
    }

    pub fn is_batched(&self) -> bool {
        self.rows() > 1
    }
}

/// A memoized prediction triple.
#[derive(Debug, Clone)]
pub struct MemoEntry {
    pub latent_next_obs: Tensor,
    pub reward: Tensor,
    pub term: Tensor,
}

/// Unbounded associative store of memoized predictions. Entries live until cleared.
#[derive(Debug, Default)]
pub struct MemoStore {
    memos: HashMap<HashedTensor, MemoEntry>,
}

impl MemoStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &HashedTensor) -> Option<&MemoEntry> {
        self.memos.get(key)
    }

    pub fn contains(&self, key: &HashedTensor) -> bool {
        self.memos.contains_key(key)
    }

    /// Insert or overwrite the entry for `key`.
    pub fn insert(&mut self, key: HashedTensor, entry: MemoEntry) {
        self.memos.insert(key, entry);
    }

    pub fn clear(&mut self) {
        self.memos.clear();
    }

    pub fn len(&self) -> usize {
        self.memos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.memos.is_empty()
    }
}
