//! Pipeline Executor
//!
//! Walks a validated `StageList` in order, issuing one GEMM per stage
//! against the `BufferSet`. A stage that touches the buffer written by the
//! stage before it is preceded by a device synchronization; a stage marked
//! `Reseed` gets its result buffer re-uploaded from the host first. After the
//! last stage exactly one download brings the result back.
//!
//! Any failure stops the run. There is no partial result.

use std::time::{Duration, Instant};

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::backend::GemmBackend;
use crate::buffer_set::BufferSet;
use crate::context::ExecutionContext;
use crate::error::{DeviceError, PipelineError, Result};
use crate::stage::{ResultSeed, StageList};

/// Knobs for a run
#[derive(Debug, Clone, Copy, Default)]
pub struct ExecutorOptions {
    /// Fail the run if the downloaded result contains NaN or infinity
    pub validate_finite: bool,
}

/// What happened at one stage
#[derive(Debug, Clone, Serialize)]
pub struct StageRecord {
    pub index: usize,
    pub name: String,
    pub m: usize,
    pub n: usize,
    pub k: usize,
    pub seed: ResultSeed,
    pub barrier: bool,
    pub flops: u64,
    /// Host-side time to issue the stage (includes the barrier wait)
    pub elapsed_secs: f64,
}

/// Result of a completed run
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub device: String,
    pub result_buffer: String,
    pub stages: Vec<StageRecord>,
    pub elapsed_secs: f64,
    pub output_digest: String,
    #[serde(skip)]
    output: Vec<f32>,
}

impl RunReport {
    /// Final contents of the result buffer
    pub fn output(&self) -> &[f32] {
        &self.output
    }

    pub fn into_output(self) -> Vec<f32> {
        self.output
    }

    pub fn total_flops(&self) -> u64 {
        self.stages.iter().map(|s| s.flops).sum()
    }

    /// Sustained throughput over the whole run
    pub fn gflops(&self) -> f64 {
        if self.elapsed_secs <= 0.0 {
            return 0.0;
        }
        self.total_flops() as f64 / self.elapsed_secs / 1e9
    }
}

/// SHA-256 of the little-endian bytes of `data`, as lowercase hex.
pub fn output_digest(data: &[f32]) -> String {
    let mut hasher = Sha256::new();
    for value in data {
        hasher.update(value.to_le_bytes());
    }
    format!("{:x}", hasher.finalize())
}

/// Runs stage lists.
#[derive(Debug, Clone, Default)]
pub struct PipelineExecutor {
    options: ExecutorOptions,
}

impl PipelineExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: ExecutorOptions) -> Self {
        Self { options }
    }

    /// Execute every stage in order and download the final result.
    pub fn run<B: GemmBackend>(
        &self,
        stages: &StageList,
        buffers: &BufferSet,
        ctx: &mut ExecutionContext<B>,
    ) -> Result<RunReport> {
        self.preflight(stages, buffers)?;

        log::info!(
            "Running {} stages on '{}' ({:.3} GFLOP)",
            stages.len(),
            ctx.device_name(),
            stages.total_flops() as f64 / 1e9
        );

        let run_started = Instant::now();
        let mut records = Vec::with_capacity(stages.len());
        let mut last_index = 0;

        for stage in stages.iter() {
            let index = stage.index();
            let started = Instant::now();
            let compute_error = |source: DeviceError| PipelineError::Compute { stage: index, source };

            if stage.needs_barrier() {
                ctx.backend_mut().synchronize().map_err(compute_error)?;
            }

            let seed = stage.stage().result_seed();
            if seed == ResultSeed::Reseed {
                buffers.reseed(ctx, stage.c().buffer())?;
            }

            let call = stage.lower(buffers)?;
            ctx.backend_mut().gemm(&call).map_err(compute_error)?;

            let elapsed = started.elapsed();
            let (m, n, k) = stage.stage().shape();
            log::debug!(
                "Stage {} '{}': m={} n={} k={} alpha={} beta={} seed={:?} barrier={} ({:?})",
                index,
                stage.name(),
                m,
                n,
                k,
                call.alpha,
                call.beta,
                seed,
                stage.needs_barrier(),
                elapsed
            );

            records.push(StageRecord {
                index,
                name: stage.name().to_string(),
                m,
                n,
                k,
                seed,
                barrier: stage.needs_barrier(),
                flops: call.flops(),
                elapsed_secs: elapsed.as_secs_f64(),
            });
            last_index = index;
        }

        ctx.backend_mut()
            .synchronize()
            .map_err(|source| PipelineError::Compute { stage: last_index, source })?;

        let result = stages.result_buffer();
        let output = buffers.download_final(ctx, result)?;

        if self.options.validate_finite {
            if let Some(position) = output.iter().position(|v| !v.is_finite()) {
                return Err(PipelineError::Compute {
                    stage: last_index,
                    source: DeviceError::Fault(format!(
                        "non-finite value {} at element {}",
                        output[position], position
                    )),
                });
            }
        }

        let elapsed: Duration = run_started.elapsed();
        let report = RunReport {
            device: ctx.device_name().to_string(),
            result_buffer: buffers.get(result)?.name().to_string(),
            stages: records,
            elapsed_secs: elapsed.as_secs_f64(),
            output_digest: output_digest(&output),
            output,
        };

        log::info!(
            "Pipeline finished in {:?} ({:.2} GFLOP/s), digest {}",
            elapsed,
            report.gflops(),
            report.output_digest
        );
        Ok(report)
    }

    /// Checks that need no device work: buffers still live, re-seed sources present.
    fn preflight(&self, stages: &StageList, buffers: &BufferSet) -> Result<()> {
        for handle in stages.referenced_buffers() {
            buffers.live(handle)?;
        }

        for handle in stages.reseed_targets() {
            let buffer = buffers.live(handle)?;
            if buffer.host_mirror().is_none() {
                let stage = stages
                    .iter()
                    .find(|s| s.c().buffer() == handle && s.stage().result_seed() == ResultSeed::Reseed)
                    .map(|s| s.index());
                return Err(PipelineError::Configuration {
                    stage,
                    reason: format!(
                        "buffer '{}' is re-seeded but was never uploaded from the host",
                        buffer.name()
                    ),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_digest_is_stable() {
        let a = output_digest(&[1.0, 2.0, 3.0]);
        let b = output_digest(&[1.0, 2.0, 3.0]);
        let c = output_digest(&[1.0, 2.0, 3.5]);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_empty_digest() {
        assert_eq!(
            output_digest(&[]),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
