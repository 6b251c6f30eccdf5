//! Padded batches for vectorized backend calls.
//!
//! Rows of different lengths are right-padded to the longest row. The
//! attention mask marks real positions with `1` and padding with `0`, so a
//! backend never lets padding influence another row.
//!
//! ```text
//! row 0: [ 5  9  2  0  0 ]   mask [1 1 1 0 0]
//! row 1: [ 7  1  4  4  8 ]   mask [1 1 1 1 1]
//! ```

use candle_core::{Device, Tensor};

use crate::core::snapshot::KvSnapshot;
use crate::error::{Error, Result};

/// One sequence's contribution to a batched call.
#[derive(Debug, Clone)]
pub struct BatchRow {
    /// Context tokens, including any drafted candidates.
    pub tokens: Vec<u32>,
    /// Leading positions whose payloads are already cached.
    pub cached_len: usize,
    /// Trailing positions whose next-token distributions are requested.
    pub num_scored: usize,
    /// Snapshot of the cached prefix, for backends that want it.
    pub prior_kv: Option<KvSnapshot>,
}

impl BatchRow {
    /// Row for a draft call: one distribution after the last token.
    pub fn draft(tokens: Vec<u32>) -> Self {
        Self {
            tokens,
            cached_len: 0,
            num_scored: 1,
            prior_kv: None,
        }
    }

    /// Row for a verify call over `num_candidates` trailing drafted tokens.
    pub fn verify(tokens: Vec<u32>, cached_len: usize, num_candidates: usize) -> Self {
        Self {
            tokens,
            cached_len,
            num_scored: num_candidates + 1,
            prior_kv: None,
        }
    }

    /// Attach a snapshot of the cached prefix.
    pub fn with_prior_kv(mut self, snapshot: KvSnapshot) -> Self {
        self.prior_kv = Some(snapshot);
        self
    }
}

/// A right-padded batch with its attention mask.
#[derive(Debug, Clone)]
pub struct PaddedBatch {
    /// Token ids, `num_rows * max_len`, row-major.
    input_ids: Vec<u32>,
    /// `1` for real positions, `0` for padding.
    attention_mask: Vec<u8>,
    rows: Vec<BatchRow>,
    max_len: usize,
    pad_token_id: u32,
}

impl PaddedBatch {
    /// Pad `rows` into one batch.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedBatch`] for an empty batch, an empty row, a
    /// cached prefix longer than its row, a scored window outside its row, or
    /// a prior snapshot that does not cover exactly the cached prefix.
    pub fn new(rows: Vec<BatchRow>, pad_token_id: u32) -> Result<Self> {
        if rows.is_empty() {
            return Err(Error::MalformedBatch("batch has no rows".into()));
        }
        for (idx, row) in rows.iter().enumerate() {
            let len = row.tokens.len();
            if len == 0 {
                return Err(Error::MalformedBatch(format!("row {idx} is empty")));
            }
            if row.cached_len > len {
                return Err(Error::MalformedBatch(format!(
                    "row {idx}: {} cached positions for {len} tokens",
                    row.cached_len
                )));
            }
            if row.num_scored == 0 || row.num_scored > len {
                return Err(Error::MalformedBatch(format!(
                    "row {idx}: {} scored positions for {len} tokens",
                    row.num_scored
                )));
            }
            if let Some(prior) = &row.prior_kv {
                if prior.num_tokens() != row.cached_len {
                    return Err(Error::MalformedBatch(format!(
                        "row {idx}: prior snapshot covers {} of {} cached positions",
                        prior.num_tokens(),
                        row.cached_len
                    )));
                }
            }
        }

        let max_len = rows.iter().map(|r| r.tokens.len()).max().unwrap_or(0);
        let mut input_ids = Vec::with_capacity(rows.len() * max_len);
        let mut attention_mask = Vec::with_capacity(rows.len() * max_len);
        for row in &rows {
            let pad = max_len - row.tokens.len();
            input_ids.extend_from_slice(&row.tokens);
            input_ids.extend(std::iter::repeat(pad_token_id).take(pad));
            attention_mask.extend(std::iter::repeat(1u8).take(row.tokens.len()));
            attention_mask.extend(std::iter::repeat(0u8).take(pad));
        }

        Ok(Self {
            input_ids,
            attention_mask,
            rows,
            max_len,
            pad_token_id,
        })
    }

    /// Number of rows.
    pub fn num_rows(&self) -> usize {
        self.rows.len()
    }

    /// Padded row length.
    pub fn max_len(&self) -> usize {
        self.max_len
    }

    /// Token id used for padding.
    pub fn pad_token_id(&self) -> u32 {
        self.pad_token_id
    }

    /// Flat padded token ids.
    pub fn input_ids(&self) -> &[u32] {
        &self.input_ids
    }

    /// Flat attention mask.
    pub fn attention_mask(&self) -> &[u8] {
        &self.attention_mask
    }

    /// Unpadded tokens of one row.
    pub fn row_tokens(&self, row: usize) -> &[u32] {
        &self.rows[row].tokens
    }

    /// Mask of one row.
    pub fn mask_row(&self, row: usize) -> &[u8] {
        &self.attention_mask[row * self.max_len..(row + 1) * self.max_len]
    }

    /// Unpadded length of one row.
    pub fn row_len(&self, row: usize) -> usize {
        self.rows[row].tokens.len()
    }

    /// Cached prefix length of one row.
    pub fn cached_len(&self, row: usize) -> usize {
        self.rows[row].cached_len
    }

    /// Scored trailing positions of one row.
    pub fn num_scored(&self, row: usize) -> usize {
        self.rows[row].num_scored
    }

    /// Prior snapshot of one row, if attached.
    pub fn prior_kv(&self, row: usize) -> Option<&KvSnapshot> {
        self.rows[row].prior_kv.as_ref()
    }

    /// Token ids and mask as `[num_rows, max_len]` tensors (`u32`, `u8`).
    pub fn to_tensors(&self, device: &Device) -> candle_core::Result<(Tensor, Tensor)> {
        let shape = (self.rows.len(), self.max_len);
        let ids = Tensor::from_slice(&self.input_ids, shape, device)?;
        let mask = Tensor::from_slice(&self.attention_mask, shape, device)?;
        Ok((ids, mask))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::snapshot::KvLayout;

    #[test]
    fn test_padding_and_mask() {
        let batch = PaddedBatch::new(
            vec![BatchRow::draft(vec![5, 9, 2]), BatchRow::draft(vec![7, 1, 4, 4, 8])],
            0,
        )
        .unwrap();

        assert_eq!(batch.num_rows(), 2);
        assert_eq!(batch.max_len(), 5);
        assert_eq!(batch.input_ids(), &[5, 9, 2, 0, 0, 7, 1, 4, 4, 8]);
        assert_eq!(batch.mask_row(0), &[1, 1, 1, 0, 0]);
        assert_eq!(batch.mask_row(1), &[1, 1, 1, 1, 1]);
        assert_eq!(batch.row_tokens(0), &[5, 9, 2]);
    }

    #[test]
    fn test_rejects_malformed_rows() {
        assert!(PaddedBatch::new(vec![], 0).is_err());
        assert!(PaddedBatch::new(vec![BatchRow::draft(vec![])], 0).is_err());
        assert!(PaddedBatch::new(vec![BatchRow::verify(vec![1, 2], 3, 0)], 0).is_err());
        assert!(PaddedBatch::new(vec![BatchRow::verify(vec![1, 2], 0, 2)], 0).is_err());

        let prior = KvSnapshot::empty(KvLayout::new(1, 4));
        let row = BatchRow::verify(vec![1, 2, 3], 1, 1).with_prior_kv(prior);
        assert!(matches!(
            PaddedBatch::new(vec![row], 0),
            Err(Error::MalformedBatch(_))
        ));
    }

    #[test]
    fn test_to_tensors() {
        let batch = PaddedBatch::new(
            vec![BatchRow::draft(vec![3]), BatchRow::draft(vec![1, 2])],
            9,
        )
        .unwrap();
        let (ids, mask) = batch.to_tensors(&Device::Cpu).unwrap();
        assert_eq!(ids.dims(), &[2, 2]);
        assert_eq!(ids.to_vec2::<u32>().unwrap(), vec![vec![3, 9], vec![1, 2]]);
        assert_eq!(mask.to_vec2::<u8>().unwrap(), vec![vec![1, 0], vec![1, 1]]);
    }
}
