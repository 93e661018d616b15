//! Built-in pipeline descriptions

use crate::backend::Transpose;
use crate::buffer_set::{BufferRole, Layout};
use crate::config::{BufferSpec, Fill, PipelineDescription, StageSpec};
use crate::stage::ResultSeed;

/// Names accepted by `by_name`
pub const PRESET_NAMES: [&str; 2] = ["conv-ladder", "tiny"];

/// `(spatial, filters, k)` of each convolution lowered to GEMM.
///
/// A 416x416 input shrinks to 13x13 while the filter count grows, then the
/// last stages fan back out at 26x26.
const CONV_LADDER: [(usize, usize, usize); 11] = [
    (173056, 16, 27),
    (43264, 32, 144),
    (10816, 64, 288),
    (2704, 128, 576),
    (676, 256, 1152),
    (169, 512, 2304),
    (169, 256, 1024),
    (169, 255, 512),
    (169, 128, 256),
    (676, 256, 3456),
    (676, 255, 256),
];

pub fn by_name(name: &str) -> Option<PipelineDescription> {
    match name {
        "conv-ladder" => Some(conv_ladder()),
        "tiny" => Some(tiny()),
        _ => None,
    }
}

/// Eleven convolution layers as row-major GEMMs over three shared buffers.
///
/// `output[filters x spatial] = weights[filters x k] * columns[k x spatial]`.
/// Every stage accumulates (`beta = 1`) onto the host seed: stage 0 starts
/// from the initial upload and every later stage re-seeds first, so no
/// stage sees another stage's result.
pub fn conv_ladder() -> PipelineDescription {
    let stages = CONV_LADDER
        .iter()
        .enumerate()
        .map(|(i, &(spatial, filters, k))| StageSpec {
            m: filters,
            n: spatial,
            k,
            lda: Some(k),
            ldb: Some(spatial),
            ldc: Some(spatial),
            trans_a: Transpose::No,
            trans_b: Transpose::No,
            alpha: 1.0,
            beta: 1.0,
            a: "weights".to_string(),
            b: "columns".to_string(),
            c: "output".to_string(),
            seed: if i == 0 {
                ResultSeed::Carry
            } else {
                ResultSeed::Reseed
            },
            label: Some(format!("conv{:02}", i + 1)),
        })
        .collect();

    PipelineDescription {
        layout: Layout::RowMajor,
        buffers: vec![
            auto_sized("weights", BufferRole::A, Fill::Constant { value: 1.0 }),
            auto_sized("columns", BufferRole::B, Fill::Constant { value: 1.0 }),
            auto_sized("output", BufferRole::C, Fill::Constant { value: 1.0 }),
        ],
        stages,
    }
}

/// Three small column-major stages: overwrite, carry-accumulate, re-seed.
pub fn tiny() -> PipelineDescription {
    let stage = |m, n, k, beta, seed, label: &str| StageSpec {
        m,
        n,
        k,
        lda: None,
        ldb: None,
        ldc: Some(8),
        trans_a: Transpose::No,
        trans_b: Transpose::No,
        alpha: 1.0,
        beta,
        a: "a".to_string(),
        b: "b".to_string(),
        c: "c".to_string(),
        seed,
        label: Some(label.to_string()),
    };

    PipelineDescription {
        layout: Layout::ColumnMajor,
        buffers: vec![
            auto_sized(
                "a",
                BufferRole::A,
                Fill::Ramp { start: 0.5, step: 0.25, wrap: Some(7) },
            ),
            auto_sized(
                "b",
                BufferRole::B,
                Fill::Ramp { start: -1.0, step: 0.5, wrap: Some(5) },
            ),
            auto_sized("c", BufferRole::C, Fill::Constant { value: 0.0 }),
        ],
        stages: vec![
            stage(8, 6, 4, 0.0, ResultSeed::Carry, "project"),
            stage(6, 6, 6, 1.0, ResultSeed::Carry, "accumulate"),
            stage(8, 4, 3, 1.0, ResultSeed::Reseed, "reset"),
        ],
    }
}

fn auto_sized(name: &str, role: BufferRole, fill: Fill) -> BufferSpec {
    BufferSpec {
        name: name.to_string(),
        role,
        elements: None,
        fill,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_name_resolves() {
        for name in PRESET_NAMES {
            assert!(by_name(name).is_some(), "{name}");
        }
        assert!(by_name("resnet").is_none());
    }

    #[test]
    fn test_conv_ladder_sizes_cover_every_stage() {
        let desc = conv_ladder();
        assert_eq!(desc.stages.len(), 11);
        // 512 filters x 2304: (512 - 1) * 2304 + 2304
        assert_eq!(desc.required_elements("weights").unwrap(), 512 * 2304);
        // 144 x 43264 im2col matrix is the widest input
        assert_eq!(desc.required_elements("columns").unwrap(), 144 * 43264);
        assert_eq!(desc.required_elements("output").unwrap(), 16 * 173056);
    }

    #[test]
    fn test_tiny_sizes() {
        let desc = tiny();
        assert_eq!(desc.required_elements("a").unwrap(), 36);
        assert_eq!(desc.required_elements("b").unwrap(), 36);
        // ldc = 8: widest is 8 * 5 + 8 from stage 0
        assert_eq!(desc.required_elements("c").unwrap(), 48);
    }
}
