//! Pipeline descriptions
//!
//! A JSON document names the buffers, how to fill them from the host, and
//! the stages that run over them. Buffers without an explicit size are
//! sized to the largest footprint any stage needs.
//!
//! ```json
//! {
//!   "layout": "row_major",
//!   "buffers": [
//!     { "name": "weights", "role": "A", "fill": { "kind": "constant", "value": 1.0 } },
//!     { "name": "columns", "role": "B" },
//!     { "name": "output",  "role": "C", "elements": 4096 }
//!   ],
//!   "stages": [
//!     { "m": 16, "n": 64, "k": 27, "a": "weights", "b": "columns", "c": "output" },
//!     { "m": 32, "n": 16, "k": 64, "a": "weights", "b": "columns", "c": "output",
//!       "beta": 1.0, "seed": "reseed" }
//!   ]
//! }
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::backend::{GemmBackend, Transpose};
use crate::buffer_set::{BufferHandle, BufferRole, BufferSet, Layout, ELEMENT_SIZE};
use crate::context::ExecutionContext;
use crate::error::{PipelineError, Result};
use crate::executor::{PipelineExecutor, RunReport};
use crate::stage::{ResultSeed, Stage, StageList, StageListBuilder};

/// Host data pattern for a buffer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Fill {
    Constant { value: f32 },
    /// `start + step * (i % wrap)`; without `wrap` the ramp never restarts
    Ramp {
        start: f32,
        step: f32,
        #[serde(default)]
        wrap: Option<usize>,
    },
    /// Ones on the diagonal of a column-major matrix with stride `ld`
    Identity { ld: usize },
}

impl Default for Fill {
    fn default() -> Self {
        Fill::Constant { value: 1.0 }
    }
}

impl Fill {
    pub fn generate(&self, len: usize) -> Vec<f32> {
        match self {
            Fill::Constant { value } => vec![*value; len],
            Fill::Ramp { start, step, wrap } => (0..len)
                .map(|i| {
                    let i = match wrap {
                        Some(w) if *w > 0 => i % w,
                        _ => i,
                    };
                    start + step * i as f32
                })
                .collect(),
            Fill::Identity { ld } => {
                let mut data = vec![0.0; len];
                // Diagonal element j sits at j * (ld + 1)
                let step = ld.saturating_add(1);
                let mut index = 0;
                while index < len {
                    data[index] = 1.0;
                    index = index.saturating_add(step);
                }
                data
            }
        }
    }
}

/// One buffer declaration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BufferSpec {
    pub name: String,
    pub role: BufferRole,
    /// Capacity in elements; derived from the stages when omitted
    #[serde(default)]
    pub elements: Option<usize>,
    #[serde(default)]
    pub fill: Fill,
}

fn default_alpha() -> f32 {
    1.0
}

/// One stage declaration, operands referenced by buffer name
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageSpec {
    pub m: usize,
    pub n: usize,
    pub k: usize,
    #[serde(default)]
    pub lda: Option<usize>,
    #[serde(default)]
    pub ldb: Option<usize>,
    #[serde(default)]
    pub ldc: Option<usize>,
    #[serde(default)]
    pub trans_a: Transpose,
    #[serde(default)]
    pub trans_b: Transpose,
    #[serde(default = "default_alpha")]
    pub alpha: f32,
    #[serde(default)]
    pub beta: f32,
    pub a: String,
    pub b: String,
    pub c: String,
    #[serde(default)]
    pub seed: ResultSeed,
    #[serde(default)]
    pub label: Option<String>,
}

impl StageSpec {
    /// Stage without operands bound; used for footprints and later binding.
    fn unbound(&self) -> Stage {
        let mut stage = Stage::new(self.m, self.n, self.k)
            .transpose_a(self.trans_a)
            .transpose_b(self.trans_b)
            .alpha(self.alpha)
            .beta(self.beta)
            .seed(self.seed);
        if let Some(lda) = self.lda {
            stage = stage.lda(lda);
        }
        if let Some(ldb) = self.ldb {
            stage = stage.ldb(ldb);
        }
        if let Some(ldc) = self.ldc {
            stage = stage.ldc(ldc);
        }
        if let Some(label) = &self.label {
            stage = stage.label(label.clone());
        }
        stage
    }
}

/// Complete pipeline description
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineDescription {
    #[serde(default)]
    pub layout: Layout,
    pub buffers: Vec<BufferSpec>,
    pub stages: Vec<StageSpec>,
}

impl PipelineDescription {
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        log::debug!("Loaded pipeline description from {}", path.as_ref().display());
        Self::from_json_str(&text)
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Largest footprint, in elements, any stage addresses in buffer `name`.
    pub fn required_elements(&self, name: &str) -> Result<usize> {
        let mut required = 0;
        for (index, spec) in self.stages.iter().enumerate() {
            let footprints = spec.unbound().operand_footprints(self.layout).ok_or_else(|| {
                PipelineError::config_at(index, "operand footprint overflows the address space")
            })?;
            for (operand, footprint) in [&spec.a, &spec.b, &spec.c].into_iter().zip(footprints) {
                if operand == name {
                    required = required.max(footprint);
                }
            }
        }
        Ok(required)
    }

    /// Capacity of a buffer in elements, explicit or derived.
    pub fn capacity_elements(&self, spec: &BufferSpec) -> Result<usize> {
        match spec.elements {
            Some(elements) => Ok(elements),
            None => {
                let required = self.required_elements(&spec.name)?;
                if required == 0 {
                    return Err(PipelineError::config(format!(
                        "buffer '{}' has no size and no stage uses it",
                        spec.name
                    )));
                }
                Ok(required)
            }
        }
    }

    /// Allocate buffers and validate stages. No host data is transferred.
    pub fn prepare<B: GemmBackend>(&self, ctx: &mut ExecutionContext<B>) -> Result<PreparedPipeline> {
        // Sizes are resolved up front so a bad declaration allocates nothing
        let sizes = self
            .buffers
            .iter()
            .map(|spec| {
                let elements = self.capacity_elements(spec)?;
                let bytes = u64::try_from(elements)
                    .ok()
                    .and_then(|e| e.checked_mul(ELEMENT_SIZE))
                    .ok_or_else(|| {
                        PipelineError::config(format!(
                            "buffer '{}' of {} elements overflows the address space",
                            spec.name, elements
                        ))
                    })?;
                Ok((elements, bytes))
            })
            .collect::<Result<Vec<_>>>()?;

        let mut buffers = BufferSet::new();
        let mut inputs = Vec::with_capacity(self.buffers.len());
        for (spec, (elements, bytes)) in self.buffers.iter().zip(sizes) {
            match buffers.allocate(ctx, spec.name.clone(), spec.role, bytes) {
                Ok(handle) => inputs.push((handle, spec.fill.clone(), elements)),
                Err(e) => {
                    buffers.release_all(ctx)?;
                    return Err(e);
                }
            }
        }

        let stages = match self.build_stages(&buffers) {
            Ok(stages) => stages,
            Err(e) => {
                buffers.release_all(ctx)?;
                return Err(e);
            }
        };

        Ok(PreparedPipeline {
            buffers,
            stages,
            inputs,
        })
    }

    /// Bind names to handles and validate.
    pub fn build_stages(&self, buffers: &BufferSet) -> Result<StageList> {
        let mut builder = StageListBuilder::new(self.layout);
        for (index, spec) in self.stages.iter().enumerate() {
            let lookup = |name: &str| {
                buffers.handle_by_name(name).ok_or_else(|| {
                    PipelineError::config_at(index, format!("unknown buffer '{}'", name))
                })
            };
            let stage = spec
                .unbound()
                .operands(lookup(&spec.a)?, lookup(&spec.b)?, lookup(&spec.c)?);
            builder.add(stage);
        }
        builder.build(buffers)
    }
}

/// Buffers allocated and stages validated, ready to upload and run.
pub struct PreparedPipeline {
    buffers: BufferSet,
    stages: StageList,
    inputs: Vec<(BufferHandle, Fill, usize)>,
}

impl PreparedPipeline {
    pub fn buffers(&self) -> &BufferSet {
        &self.buffers
    }

    pub fn stages(&self) -> &StageList {
        &self.stages
    }

    /// Generate every buffer's host pattern and upload it.
    pub fn upload_inputs<B: GemmBackend>(&mut self, ctx: &mut ExecutionContext<B>) -> Result<()> {
        for (handle, fill, elements) in &self.inputs {
            let data = fill.generate(*elements);
            self.buffers.upload_initial(ctx, *handle, &data)?;
        }
        Ok(())
    }

    /// Upload inputs, run all stages and release the buffers.
    ///
    /// Buffers are released whether or not the run succeeds.
    pub fn execute<B: GemmBackend>(
        mut self,
        executor: &PipelineExecutor,
        ctx: &mut ExecutionContext<B>,
    ) -> Result<RunReport> {
        let outcome = self
            .upload_inputs(ctx)
            .and_then(|_| executor.run(&self.stages, &self.buffers, ctx));
        let released = self.buffers.release_all(ctx);
        let report = outcome?;
        released?;
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::CpuBackend;

    const TWO_STAGE: &str = r#"{
        "layout": "column_major",
        "buffers": [
            { "name": "a", "role": "A", "fill": { "kind": "ramp", "start": 1.0, "step": 1.0 } },
            { "name": "b", "role": "B", "fill": { "kind": "constant", "value": 2.0 } },
            { "name": "c", "role": "C", "fill": { "kind": "constant", "value": 0.0 } }
        ],
        "stages": [
            { "m": 2, "n": 2, "k": 3, "a": "a", "b": "b", "c": "c" },
            { "m": 2, "n": 2, "k": 2, "a": "a", "b": "b", "c": "c", "beta": 1.0, "label": "acc" }
        ]
    }"#;

    #[test]
    fn test_parse_defaults() {
        let desc = PipelineDescription::from_json_str(TWO_STAGE).unwrap();
        assert_eq!(desc.layout, Layout::ColumnMajor);
        assert_eq!(desc.stages[0].alpha, 1.0);
        assert_eq!(desc.stages[0].beta, 0.0);
        assert_eq!(desc.stages[0].trans_a, Transpose::No);
        assert_eq!(desc.stages[1].seed, ResultSeed::Carry);
        assert_eq!(desc.stages[1].label.as_deref(), Some("acc"));
    }

    #[test]
    fn test_required_elements() {
        let desc = PipelineDescription::from_json_str(TWO_STAGE).unwrap();
        assert_eq!(desc.required_elements("a").unwrap(), 6);
        assert_eq!(desc.required_elements("b").unwrap(), 6);
        assert_eq!(desc.required_elements("c").unwrap(), 4);
        assert_eq!(desc.required_elements("missing").unwrap(), 0);
    }

    #[test]
    fn test_overflowing_leading_dim_sized_buffers_rejected() {
        let mut desc = PipelineDescription::from_json_str(TWO_STAGE).unwrap();
        desc.stages[1].lda = Some(usize::MAX);
        let err = desc.required_elements("a").err().unwrap();
        assert_eq!(err.stage(), Some(1));

        let mut ctx = ExecutionContext::new(CpuBackend::new());
        let err = desc.prepare(&mut ctx).err().unwrap();
        assert!(matches!(err, PipelineError::Configuration { .. }));
        assert_eq!(ctx.backend().stats().allocations, 0);
        assert_eq!(ctx.backend().stats().transfers(), 0);
    }

    #[test]
    fn test_overflowing_leading_dim_explicit_buffers_rejected() {
        let json = r#"{
            "buffers": [
                { "name": "a", "role": "A", "elements": 6 },
                { "name": "b", "role": "B", "elements": 6 },
                { "name": "c", "role": "C", "elements": 4 }
            ],
            "stages": [
                { "m": 2, "n": 2, "k": 3, "lda": 18446744073709551615, "a": "a", "b": "b", "c": "c" }
            ]
        }"#;
        let desc = PipelineDescription::from_json_str(json).unwrap();
        let mut ctx = ExecutionContext::new(CpuBackend::new());
        let err = desc.prepare(&mut ctx).err().unwrap();
        assert!(matches!(err, PipelineError::Configuration { .. }));
        assert_eq!(err.stage(), Some(0));
        // Allocations rolled back, nothing uploaded
        assert_eq!(ctx.backend().memory_used(), 0);
        assert_eq!(ctx.backend().stats().transfers(), 0);
    }

    #[test]
    fn test_oversized_buffer_rejected_before_allocation() {
        let mut desc = PipelineDescription::from_json_str(TWO_STAGE).unwrap();
        desc.buffers[2].elements = Some(usize::MAX);
        let mut ctx = ExecutionContext::new(CpuBackend::new());
        assert!(matches!(
            desc.prepare(&mut ctx).err().unwrap(),
            PipelineError::Configuration { .. }
        ));
        assert_eq!(ctx.backend().stats().allocations, 0);
    }

    #[test]
    fn test_execute_two_stage() {
        let desc = PipelineDescription::from_json_str(TWO_STAGE).unwrap();
        let mut ctx = ExecutionContext::new(CpuBackend::new());
        let prepared = desc.prepare(&mut ctx).unwrap();
        assert_eq!(ctx.backend().stats().transfers(), 0);

        let report = prepared.execute(&PipelineExecutor::new(), &mut ctx).unwrap();

        // A = [[1,3,5],[2,4,6]], B = 2s: stage 0 gives [[18,18],[24,24]]
        // stage 1 uses A[:, :2] = [[1,3],[2,4]]: adds [[8,8],[12,12]]
        assert_eq!(report.output(), &[26.0, 36.0, 26.0, 36.0]);
        assert_eq!(report.stages[1].name, "acc");
        assert_eq!(ctx.backend().memory_used(), 0);
    }

    #[test]
    fn test_unknown_buffer_is_configuration_error() {
        let mut desc = PipelineDescription::from_json_str(TWO_STAGE).unwrap();
        desc.stages[1].b = "nope".to_string();
        let mut ctx = ExecutionContext::new(CpuBackend::new());
        let err = desc.prepare(&mut ctx).err().unwrap();
        assert_eq!(err.stage(), Some(1));
        // Allocations rolled back, nothing uploaded
        assert_eq!(ctx.backend().memory_used(), 0);
        assert_eq!(ctx.backend().stats().uploads, 0);
    }

    #[test]
    fn test_unused_unsized_buffer_rejected() {
        let mut desc = PipelineDescription::from_json_str(TWO_STAGE).unwrap();
        desc.buffers.push(BufferSpec {
            name: "spare".to_string(),
            role: BufferRole::C,
            elements: None,
            fill: Fill::default(),
        });
        let mut ctx = ExecutionContext::new(CpuBackend::new());
        assert!(matches!(
            desc.prepare(&mut ctx).err().unwrap(),
            PipelineError::Configuration { .. }
        ));
        assert_eq!(ctx.backend().stats().allocations, 0);
    }

    #[test]
    fn test_fill_patterns() {
        assert_eq!(Fill::Constant { value: 3.0 }.generate(2), vec![3.0, 3.0]);
        assert_eq!(
            Fill::Ramp { start: 0.0, step: 0.5, wrap: Some(2) }.generate(4),
            vec![0.0, 0.5, 0.0, 0.5]
        );
        assert_eq!(
            Fill::Identity { ld: 2 }.generate(4),
            vec![1.0, 0.0, 0.0, 1.0]
        );
        assert_eq!(
            Fill::Identity { ld: usize::MAX }.generate(4),
            vec![1.0, 0.0, 0.0, 0.0]
        );
    }

    #[test]
    fn test_round_trip_json() {
        let desc = PipelineDescription::from_json_str(TWO_STAGE).unwrap();
        let json = desc.to_json_pretty().unwrap();
        assert_eq!(PipelineDescription::from_json_str(&json).unwrap(), desc);
    }
}
