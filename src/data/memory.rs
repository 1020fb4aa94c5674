/// Loader over batches that are already materialized
use candle_core::{Device, Result};

use super::{Batch, BatchDataLoader};

/// Replays a fixed list of batches every epoch, in order
pub struct VecDataLoader {
    batches: Vec<Batch>,
    current_idx: usize,
}

impl VecDataLoader {
    pub fn new(batches: Vec<Batch>) -> Self {
        Self {
            batches,
            current_idx: 0,
        }
    }

    pub fn batches(&self) -> &[Batch] {
        &self.batches
    }
}

impl BatchDataLoader for VecDataLoader {
    fn next_batch(&mut self, device: &Device) -> Result<Option<Batch>> {
        match self.batches.get(self.current_idx) {
            Some(batch) => {
                self.current_idx += 1;
                batch.to_device(device).map(Some)
            }
            None => Ok(None),
        }
    }

    fn reset(&mut self) {
        self.current_idx = 0;
    }

    fn num_batches(&self) -> usize {
        self.batches.len()
    }
}
