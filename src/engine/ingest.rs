// # Sample Ingestion
//
// Adding records to a forest's bounded sample array: reservoir sampling
// once the array is full, optional duplicate rejection, aggregate-mode
// accumulation, and the saved-mode replay path used when a snapshot is
// reloaded.

use crate::engine::forest::Sample;
use crate::engine::Engine;

impl Engine {
    /// Parse a record's fields into a dimension vector and ingest it.
    pub fn add_sample_fields(&mut self, idx: usize, values: &[String]) {
        let row = self.dims.parse_values(values, false);
        self.add_sample_row(idx, row, false);
    }

    /// Ingest one dimension vector into the forest at `idx`.
    ///
    /// While the array is below `samples_total` the row is placed at a
    /// random position and the displaced sample moves to the end, keeping
    /// the array shuffled for the ring-slice tree builds. Beyond the bound
    /// the row replaces a random sample with probability
    /// `samples_total / (|X| + extra_rows)`.
    ///
    /// Saved mode (snapshot replay) skips duplicate rejection and the
    /// stream counters.
    pub fn add_sample_row(&mut self, idx: usize, row: Vec<f64>, saved: bool) {
        let samples_total = self.settings.samples_total();
        let unique = self.settings.unique_samples as usize;

        if !saved && unique > 0 && self.rng.below(101) <= unique {
            if self.forests[idx].samples.iter().any(|s| s.values == row) {
                return;
            }
        }

        if !saved {
            self.forests[idx].trained_rows += 1;
        }

        let count = self.forests[idx].samples.len();
        if count < samples_total {
            if count == 0 {
                self.forests[idx].samples.push(Sample::new(row));
            } else {
                let pos = self.rng.below(count);
                let f = &mut self.forests[idx];
                let displaced = f.samples[pos].clone();
                f.samples.push(displaced);
                f.samples[pos] = Sample::new(row);
            }
        } else {
            self.forests[idx].extra_rows += 1;
            let extra = self.forests[idx].extra_rows;
            let pos = self.rng.below(count + extra);
            if pos < samples_total && pos < count {
                self.forests[idx].samples[pos] = Sample::new(row);
            }
        }
    }

    /// Aggregate-mode ingestion: every record of a category adds its
    /// values component-wise into one accumulating summary sample.
    pub fn add_aggregate_fields(&mut self, idx: usize, values: &[String]) {
        let row = self.dims.parse_values(values, false);
        let dimensions = self.dims.dimensions;
        let samples_total = self.settings.samples_total();

        let summary_idx = match self.forests[idx].summary_idx {
            Some(i) => i,
            None => {
                let count = self.forests[idx].samples.len();
                let i = if count < samples_total {
                    self.forests[idx]
                        .samples
                        .push(Sample::new(vec![0.0; dimensions]));
                    count
                } else {
                    let pos = self.rng.below(count);
                    self.forests[idx].samples[pos] = Sample::new(vec![0.0; dimensions]);
                    pos
                };
                self.forests[idx].summary_idx = Some(i);
                i
            }
        };

        let target = &mut self.forests[idx].samples[summary_idx];
        for (d, v) in row.into_iter().enumerate() {
            target.values[d] += v;
        }
    }
}
