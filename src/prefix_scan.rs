use rayon::prelude::*;

use crate::{
    engine::{Engine, Stage},
    error::Result,
    operation::Operation,
    segment::Attachment,
};

/// Number of Hillis–Steele stages needed for `n` values: `ceil(log2 n)`.
pub fn stage_count(n: usize) -> u32 {
    if n <= 1 {
        0
    } else {
        usize::BITS - (n - 1).leading_zeros()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScanOutput {
    pub values: Vec<i32>,
    pub stages: u32,
}

/// A backend able to run the scan. The dispatcher holds one behind an `Arc`.
pub trait Scanner: Send + Sync {
    fn scan(&self, op: Operation, input: &[i32]) -> Result<ScanOutput>;

    /// Scans the values of an attached segment in place, then publishes the result.
    fn scan_segment(&self, op: Operation, segment: &Attachment) -> Result<ScanOutput> {
        let input = segment.read_values()?;
        let output = self.scan(op, &input)?;
        segment.write_values(&output.values)?;
        segment.publish_result()?;
        Ok(output)
    }
}

impl Scanner for Engine {
    fn scan(&self, op: Operation, input: &[i32]) -> Result<ScanOutput> {
        Ok(self.inclusive_scan(op, input))
    }
}

impl Engine {
    /// Inclusive scan of `input` under `op`.
    ///
    /// Each stage reads only `current` and writes only `next`; the pool's
    /// `install` returns once every index of the stage is written.
    pub fn inclusive_scan(&self, op: Operation, input: &[i32]) -> ScanOutput {
        let n = input.len();
        let mut current = input.to_vec();

        if n <= 1 {
            return ScanOutput {
                values: current,
                stages: 0,
            };
        }

        let mut next = vec![0i32; n];
        let chunk = n.div_ceil(self.workers);
        let hook = self.hook.as_deref();

        let mut stage = Stage {
            index: 0,
            stride: 1,
        };

        while stage.stride < n {
            let src = &current;
            self.pool.install(|| {
                next.par_chunks_mut(chunk)
                    .enumerate()
                    .for_each(|(c, out)| {
                        let base = c * chunk;
                        for (k, slot) in out.iter_mut().enumerate() {
                            let i = base + k;
                            if let Some(hook) = hook {
                                hook(stage, i);
                            }
                            *slot = if i >= stage.stride {
                                op.combine(src[i], src[i - stage.stride])
                            } else {
                                src[i]
                            };
                        }
                    });
            });

            std::mem::swap(&mut current, &mut next);
            tracing::trace!(stage = stage.index, stride = stage.stride, values = ?current, "stage done");

            stage.index += 1;
            stage.stride <<= 1;
        }

        ScanOutput {
            values: current,
            stages: stage.index,
        }
    }
}
