//! Stage Descriptor List
//!
//! A stage is one GEMM with its own shapes, strides, scale factors and
//! result-seeding policy. Stages are collected with `StageListBuilder` and
//! validated against the `BufferSet` in one pass, so a bad shape in stage 2
//! is reported before stage 0 ever touches the device.

use serde::{Deserialize, Serialize};

use crate::backend::{GemmCall, Transpose};
use crate::buffer_set::{BufferHandle, BufferRole, BufferSet, Layout, MatrixView};
use crate::error::{PipelineError, Result};

/// What the result buffer holds when a stage starts.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultSeed {
    /// Whatever the previous stage (or the initial upload) left behind
    #[default]
    Carry,
    /// The buffer's host pattern, re-uploaded right before the GEMM
    Reseed,
}

/// One GEMM: `C = alpha * op(A) * op(B) + beta * C`, with `op(A)` of shape
/// `m x k` and `op(B)` of shape `k x n`.
#[derive(Clone, Debug, PartialEq)]
pub struct Stage {
    m: usize,
    n: usize,
    k: usize,
    lda: Option<usize>,
    ldb: Option<usize>,
    ldc: Option<usize>,
    trans_a: Transpose,
    trans_b: Transpose,
    alpha: f32,
    beta: f32,
    operands: Option<[BufferHandle; 3]>,
    seed: ResultSeed,
    label: Option<String>,
}

impl Stage {
    /// Stage with `alpha = 1`, `beta = 0`, no transposition and tight strides.
    pub fn new(m: usize, n: usize, k: usize) -> Self {
        Self {
            m,
            n,
            k,
            lda: None,
            ldb: None,
            ldc: None,
            trans_a: Transpose::No,
            trans_b: Transpose::No,
            alpha: 1.0,
            beta: 0.0,
            operands: None,
            seed: ResultSeed::Carry,
            label: None,
        }
    }

    pub fn operands(mut self, a: BufferHandle, b: BufferHandle, c: BufferHandle) -> Self {
        self.operands = Some([a, b, c]);
        self
    }

    pub fn lda(mut self, lda: usize) -> Self {
        self.lda = Some(lda);
        self
    }

    pub fn ldb(mut self, ldb: usize) -> Self {
        self.ldb = Some(ldb);
        self
    }

    pub fn ldc(mut self, ldc: usize) -> Self {
        self.ldc = Some(ldc);
        self
    }

    pub fn transpose_a(mut self, trans: Transpose) -> Self {
        self.trans_a = trans;
        self
    }

    pub fn transpose_b(mut self, trans: Transpose) -> Self {
        self.trans_b = trans;
        self
    }

    pub fn alpha(mut self, alpha: f32) -> Self {
        self.alpha = alpha;
        self
    }

    pub fn beta(mut self, beta: f32) -> Self {
        self.beta = beta;
        self
    }

    pub fn seed(mut self, seed: ResultSeed) -> Self {
        self.seed = seed;
        self
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn shape(&self) -> (usize, usize, usize) {
        (self.m, self.n, self.k)
    }

    pub fn scale(&self) -> (f32, f32) {
        (self.alpha, self.beta)
    }

    pub fn result_seed(&self) -> ResultSeed {
        self.seed
    }

    pub fn label_text(&self) -> Option<&str> {
        self.label.as_deref()
    }

    /// Stored `(rows, cols)` of A, B and C.
    pub fn stored_shapes(&self) -> [(usize, usize); 3] {
        let a = match self.trans_a {
            Transpose::No => (self.m, self.k),
            Transpose::Yes => (self.k, self.m),
        };
        let b = match self.trans_b {
            Transpose::No => (self.k, self.n),
            Transpose::Yes => (self.n, self.k),
        };
        [a, b, (self.m, self.n)]
    }

    /// Leading dimensions of A, B and C, defaulting to the tight value.
    pub fn leading_dims(&self, layout: Layout) -> [usize; 3] {
        let shapes = self.stored_shapes();
        let tight = |i: usize| layout.min_ld(shapes[i].0, shapes[i].1);
        [
            self.lda.unwrap_or_else(|| tight(0)),
            self.ldb.unwrap_or_else(|| tight(1)),
            self.ldc.unwrap_or_else(|| tight(2)),
        ]
    }

    /// Elements each operand addresses. Pure: usable before buffers exist.
    ///
    /// `None` if a stride makes any footprint overflow `usize`.
    pub fn operand_footprints(&self, layout: Layout) -> Option<[usize; 3]> {
        let shapes = self.stored_shapes();
        let lds = self.leading_dims(layout);
        Some([
            layout.footprint(shapes[0].0, shapes[0].1, lds[0])?,
            layout.footprint(shapes[1].0, shapes[1].1, lds[1])?,
            layout.footprint(shapes[2].0, shapes[2].1, lds[2])?,
        ])
    }

    pub fn flops(&self) -> u64 {
        2 * self.m as u64 * self.n as u64 * self.k as u64
    }

    fn display_name(&self, index: usize) -> String {
        match &self.label {
            Some(label) => label.clone(),
            None => format!("stage-{}", index),
        }
    }
}

/// A stage whose operands have been checked against the buffer set.
#[derive(Clone, Debug)]
pub struct ValidatedStage {
    index: usize,
    name: String,
    stage: Stage,
    views: [MatrixView; 3],
    barrier_before: bool,
}

impl ValidatedStage {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stage(&self) -> &Stage {
        &self.stage
    }

    pub fn a(&self) -> &MatrixView {
        &self.views[0]
    }

    pub fn b(&self) -> &MatrixView {
        &self.views[1]
    }

    pub fn c(&self) -> &MatrixView {
        &self.views[2]
    }

    /// True when this stage shares a buffer with the previous stage and
    /// either of them writes it: reading the previous result, or
    /// overwriting one of the previous stage's inputs.
    pub fn needs_barrier(&self) -> bool {
        self.barrier_before
    }

    /// Translate to the backend's column-major call.
    ///
    /// Row-major stages use `C^T = op(B)^T * op(A)^T`: a row-major matrix
    /// is its own transpose in column-major storage, so swapping the
    /// operands and `m`/`n` computes the row-major product without copies.
    pub fn lower(&self, buffers: &BufferSet) -> Result<GemmCall> {
        let [a, b, c] = &self.views;
        let region = |view: &MatrixView| buffers.live(view.buffer()).map(|buf| buf.region());
        let stage = &self.stage;

        let call = match a.layout() {
            Layout::ColumnMajor => GemmCall {
                trans_a: stage.trans_a,
                trans_b: stage.trans_b,
                m: stage.m,
                n: stage.n,
                k: stage.k,
                alpha: stage.alpha,
                a: region(a)?,
                lda: a.ld(),
                b: region(b)?,
                ldb: b.ld(),
                beta: stage.beta,
                c: region(c)?,
                ldc: c.ld(),
            },
            Layout::RowMajor => GemmCall {
                trans_a: stage.trans_b,
                trans_b: stage.trans_a,
                m: stage.n,
                n: stage.m,
                k: stage.k,
                alpha: stage.alpha,
                a: region(b)?,
                lda: b.ld(),
                b: region(a)?,
                ldb: a.ld(),
                beta: stage.beta,
                c: region(c)?,
                ldc: c.ld(),
            },
        };
        Ok(call)
    }
}

/// Collects stages in execution order.
#[derive(Clone, Debug, Default)]
pub struct StageListBuilder {
    layout: Layout,
    stages: Vec<Stage>,
}

impl StageListBuilder {
    pub fn new(layout: Layout) -> Self {
        Self {
            layout,
            stages: Vec::new(),
        }
    }

    pub fn push(mut self, stage: Stage) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn add(&mut self, stage: Stage) -> &mut Self {
        self.stages.push(stage);
        self
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Validate every stage against `buffers` and freeze the list.
    ///
    /// Performs no device work.
    pub fn build(self, buffers: &BufferSet) -> Result<StageList> {
        if self.stages.is_empty() {
            return Err(PipelineError::config("stage list is empty"));
        }

        let mut validated: Vec<ValidatedStage> = Vec::with_capacity(self.stages.len());
        for (index, stage) in self.stages.into_iter().enumerate() {
            let views = validate_stage(index, &stage, buffers, self.layout)?;

            let barrier_before = validated.last().is_some_and(|prev| {
                let prev_written = prev.c().buffer();
                let written = views[2].buffer();
                views.iter().any(|view| view.buffer() == prev_written)
                    || prev.views.iter().any(|view| view.buffer() == written)
            });

            if stage.seed == ResultSeed::Reseed && stage.beta == 0.0 {
                log::warn!(
                    "stage {} re-seeds its result buffer but beta = 0 discards it",
                    index
                );
            }

            validated.push(ValidatedStage {
                index,
                name: stage.display_name(index),
                stage,
                views,
                barrier_before,
            });
        }

        log::info!(
            "Stage list validated: {} stages, {:?}",
            validated.len(),
            self.layout
        );

        Ok(StageList {
            layout: self.layout,
            stages: validated,
        })
    }
}

fn validate_stage(
    index: usize,
    stage: &Stage,
    buffers: &BufferSet,
    layout: Layout,
) -> Result<[MatrixView; 3]> {
    if stage.m == 0 || stage.n == 0 || stage.k == 0 {
        return Err(PipelineError::config_at(
            index,
            format!(
                "dimensions must be positive (m={}, n={}, k={})",
                stage.m, stage.n, stage.k
            ),
        ));
    }
    if !stage.alpha.is_finite() || !stage.beta.is_finite() {
        return Err(PipelineError::config_at(
            index,
            format!("alpha={} and beta={} must be finite", stage.alpha, stage.beta),
        ));
    }

    let operands = stage
        .operands
        .ok_or_else(|| PipelineError::config_at(index, "operand buffers are not set"))?;
    let [a, b, c] = operands;
    if c == a || c == b {
        return Err(PipelineError::config_at(
            index,
            "result buffer must not also be an input operand",
        ));
    }

    let slots = [("A", BufferRole::A), ("B", BufferRole::B), ("C", BufferRole::C)];
    let shapes = stage.stored_shapes();
    let lds = stage.leading_dims(layout);

    let mut views = Vec::with_capacity(3);
    for (slot, handle) in operands.iter().enumerate() {
        let (slot_name, slot_role) = slots[slot];
        let buffer = buffers
            .live(*handle)
            .map_err(|e| PipelineError::config_at(index, format!("operand {}: {}", slot_name, e)))?;

        // Result buffers may be read back as inputs; inputs are never written
        let role_ok = buffer.role() == slot_role
            || (slot_role != BufferRole::C && buffer.role() == BufferRole::C);
        if !role_ok {
            return Err(PipelineError::config_at(
                index,
                format!(
                    "buffer '{}' has role {} and cannot be used as operand {}",
                    buffer.name(),
                    buffer.role(),
                    slot_name
                ),
            ));
        }

        let (rows, cols) = shapes[slot];
        let view = buffers
            .view(*handle, rows, cols, lds[slot], layout)
            .map_err(|e| match e {
                PipelineError::Configuration { reason, .. } => {
                    PipelineError::config_at(index, format!("operand {}: {}", slot_name, reason))
                }
                other => other,
            })?;
        views.push(view);
    }

    Ok([views[0], views[1], views[2]])
}

/// Immutable, validated, ordered stages.
#[derive(Clone, Debug)]
pub struct StageList {
    layout: Layout,
    stages: Vec<ValidatedStage>,
}

impl StageList {
    pub fn layout(&self) -> Layout {
        self.layout
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&ValidatedStage> {
        self.stages.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ValidatedStage> {
        self.stages.iter()
    }

    /// Buffer written by the last stage; the one brought back to the host.
    pub fn result_buffer(&self) -> BufferHandle {
        // build() rejects empty lists
        self.stages[self.stages.len() - 1].c().buffer()
    }

    /// Buffers re-seeded from the host at some point, in first-use order.
    pub fn reseed_targets(&self) -> Vec<BufferHandle> {
        let mut targets = Vec::new();
        for stage in &self.stages {
            let handle = stage.c().buffer();
            if stage.stage.seed == ResultSeed::Reseed && !targets.contains(&handle) {
                targets.push(handle);
            }
        }
        targets
    }

    /// Every buffer any stage references, in first-use order.
    pub fn referenced_buffers(&self) -> Vec<BufferHandle> {
        let mut handles = Vec::new();
        for stage in &self.stages {
            for view in &stage.views {
                if !handles.contains(&view.buffer()) {
                    handles.push(view.buffer());
                }
            }
        }
        handles
    }

    pub fn total_flops(&self) -> u64 {
        self.stages.iter().map(|s| s.stage.flops()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{CpuBackend, RegionId};
    use crate::context::ExecutionContext;

    struct Fixture {
        ctx: ExecutionContext<CpuBackend>,
        set: BufferSet,
        a: BufferHandle,
        b: BufferHandle,
        c: BufferHandle,
    }

    fn fixture(elements: u64) -> Fixture {
        let mut ctx = ExecutionContext::new(CpuBackend::new());
        let mut set = BufferSet::new();
        let a = set.allocate(&mut ctx, "a", BufferRole::A, elements * 4).unwrap();
        let b = set.allocate(&mut ctx, "b", BufferRole::B, elements * 4).unwrap();
        let c = set.allocate(&mut ctx, "c", BufferRole::C, elements * 4).unwrap();
        Fixture { ctx, set, a, b, c }
    }

    fn config_stage(err: PipelineError) -> Option<usize> {
        match err {
            PipelineError::Configuration { stage, .. } => stage,
            other => panic!("expected configuration error, got {other:?}"),
        }
    }

    #[test]
    fn test_tight_leading_dims() {
        let stage = Stage::new(4, 3, 5);
        assert_eq!(stage.leading_dims(Layout::ColumnMajor), [4, 5, 4]);
        assert_eq!(stage.leading_dims(Layout::RowMajor), [5, 3, 3]);

        let transposed = Stage::new(4, 3, 5)
            .transpose_a(Transpose::Yes)
            .transpose_b(Transpose::Yes);
        assert_eq!(transposed.stored_shapes(), [(5, 4), (3, 5), (4, 3)]);
        assert_eq!(transposed.leading_dims(Layout::ColumnMajor), [5, 3, 4]);
    }

    #[test]
    fn test_operand_footprints() {
        let stage = Stage::new(4, 3, 5).ldc(6);
        assert_eq!(stage.operand_footprints(Layout::ColumnMajor), Some([20, 15, 16]));
        let huge = Stage::new(2, 2, 2).lda(usize::MAX);
        assert_eq!(huge.operand_footprints(Layout::ColumnMajor), None);
    }

    #[test]
    fn test_overflowing_leading_dim_rejected() {
        let f = fixture(64);
        let err = StageListBuilder::new(Layout::ColumnMajor)
            .push(Stage::new(2, 2, 2).operands(f.a, f.b, f.c).lda(usize::MAX))
            .build(&f.set)
            .unwrap_err();
        assert_eq!(config_stage(err), Some(0));

        let err = StageListBuilder::new(Layout::RowMajor)
            .push(Stage::new(2, 2, 2).operands(f.a, f.b, f.c))
            .push(Stage::new(2, 2, 2).operands(f.a, f.b, f.c).ldc(usize::MAX))
            .build(&f.set)
            .unwrap_err();
        assert_eq!(config_stage(err), Some(1));
    }

    #[test]
    fn test_overwriting_previous_input_needs_barrier() {
        let mut f = fixture(16);
        let c2 = f.set.allocate(&mut f.ctx, "c2", BufferRole::C, 64).unwrap();
        let list = StageListBuilder::new(Layout::ColumnMajor)
            .push(Stage::new(2, 2, 2).operands(f.a, f.b, f.c))
            // Reads the first result
            .push(Stage::new(2, 2, 2).operands(f.c, f.b, c2))
            // Overwrites the buffer the second stage read
            .push(Stage::new(2, 2, 2).operands(f.a, f.b, f.c))
            // Disjoint output, shared inputs only
            .push(Stage::new(2, 2, 2).operands(f.a, f.b, c2))
            .build(&f.set)
            .unwrap();

        let barriers: Vec<bool> = list.iter().map(|s| s.needs_barrier()).collect();
        assert_eq!(barriers, [false, true, true, false]);
    }

    #[test]
    fn test_build_valid_list() {
        let f = fixture(64);
        let list = StageListBuilder::new(Layout::ColumnMajor)
            .push(Stage::new(4, 3, 5).operands(f.a, f.b, f.c).label("first"))
            .push(Stage::new(2, 2, 2).operands(f.a, f.b, f.c).beta(1.0))
            .build(&f.set)
            .unwrap();

        assert_eq!(list.len(), 2);
        assert_eq!(list.get(0).unwrap().name(), "first");
        assert_eq!(list.get(1).unwrap().name(), "stage-1");
        assert!(!list.get(0).unwrap().needs_barrier());
        assert!(list.get(1).unwrap().needs_barrier());
        assert_eq!(list.result_buffer(), f.c);
        assert_eq!(list.referenced_buffers(), vec![f.a, f.b, f.c]);
        assert_eq!(list.total_flops(), 120 + 16);
    }

    #[test]
    fn test_zero_dimension_rejected() {
        let f = fixture(64);
        let err = StageListBuilder::new(Layout::ColumnMajor)
            .push(Stage::new(2, 2, 2).operands(f.a, f.b, f.c))
            .push(Stage::new(0, 2, 2).operands(f.a, f.b, f.c))
            .build(&f.set)
            .unwrap_err();
        assert_eq!(config_stage(err), Some(1));
    }

    #[test]
    fn test_short_leading_dim_rejected() {
        let f = fixture(64);
        let err = StageListBuilder::new(Layout::ColumnMajor)
            .push(Stage::new(4, 3, 5).operands(f.a, f.b, f.c).lda(3))
            .build(&f.set)
            .unwrap_err();
        assert_eq!(config_stage(err), Some(0));
    }

    #[test]
    fn test_footprint_beyond_capacity_rejected() {
        let f = fixture(16);
        let err = StageListBuilder::new(Layout::ColumnMajor)
            .push(Stage::new(4, 4, 4).operands(f.a, f.b, f.c))
            .push(Stage::new(4, 4, 5).operands(f.a, f.b, f.c))
            .build(&f.set)
            .unwrap_err();
        assert_eq!(config_stage(err), Some(1));
    }

    #[test]
    fn test_missing_operands_and_empty_list() {
        let f = fixture(16);
        let err = StageListBuilder::new(Layout::ColumnMajor)
            .push(Stage::new(2, 2, 2))
            .build(&f.set)
            .unwrap_err();
        assert_eq!(config_stage(err), Some(0));

        let err = StageListBuilder::new(Layout::ColumnMajor)
            .build(&f.set)
            .unwrap_err();
        assert_eq!(config_stage(err), None);
    }

    #[test]
    fn test_role_mismatch_rejected() {
        let f = fixture(16);
        // Input buffer in the result slot
        let err = StageListBuilder::new(Layout::ColumnMajor)
            .push(Stage::new(2, 2, 2).operands(f.c, f.b, f.a))
            .build(&f.set)
            .unwrap_err();
        assert_eq!(config_stage(err), Some(0));

        // Aliased output
        let err = StageListBuilder::new(Layout::ColumnMajor)
            .push(Stage::new(2, 2, 2).operands(f.a, f.c, f.c))
            .build(&f.set)
            .unwrap_err();
        assert_eq!(config_stage(err), Some(0));
    }

    #[test]
    fn test_released_buffer_rejected() {
        let mut f = fixture(16);
        f.set.release(&mut f.ctx, f.b).unwrap();
        let err = StageListBuilder::new(Layout::ColumnMajor)
            .push(Stage::new(2, 2, 2).operands(f.a, f.b, f.c))
            .build(&f.set)
            .unwrap_err();
        assert_eq!(config_stage(err), Some(0));
    }

    #[test]
    fn test_build_performs_no_transfers() {
        let f = fixture(16);
        let _ = StageListBuilder::new(Layout::ColumnMajor)
            .push(Stage::new(2, 2, 2).operands(f.a, f.b, f.c))
            .build(&f.set)
            .unwrap();
        assert_eq!(f.ctx.backend().stats().transfers(), 0);
    }

    #[test]
    fn test_row_major_lowering_swaps_operands() {
        let f = fixture(64);
        let list = StageListBuilder::new(Layout::RowMajor)
            .push(Stage::new(4, 3, 5).operands(f.a, f.b, f.c))
            .build(&f.set)
            .unwrap();

        let call = list.get(0).unwrap().lower(&f.set).unwrap();
        assert_eq!((call.m, call.n, call.k), (3, 4, 5));
        assert_eq!((call.lda, call.ldb, call.ldc), (3, 5, 3));
        assert_eq!(call.a, RegionId(1));
        assert_eq!(call.b, RegionId(0));
        assert_eq!(call.c, RegionId(2));
    }

    #[test]
    fn test_reseed_targets() {
        let f = fixture(16);
        let list = StageListBuilder::new(Layout::ColumnMajor)
            .push(Stage::new(2, 2, 2).operands(f.a, f.b, f.c))
            .push(Stage::new(2, 2, 2).operands(f.a, f.b, f.c).beta(1.0).seed(ResultSeed::Reseed))
            .push(Stage::new(2, 2, 2).operands(f.a, f.b, f.c).beta(1.0).seed(ResultSeed::Reseed))
            .build(&f.set)
            .unwrap();
        assert_eq!(list.reseed_targets(), vec![f.c]);
    }
}
