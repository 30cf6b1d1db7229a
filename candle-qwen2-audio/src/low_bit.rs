//! Low-bit weight formats.
//!
//! The mode names follow the `load_in_low_bit` vocabulary used by the Python
//! tooling around this model (`sym_int4`, `asym_int4`, ...). Each of them maps
//! onto a GGML block format that candle's quantized matmul kernels execute on
//! CPU, CUDA and Metal.

use std::fmt;
use std::str::FromStr;

use candle::quantized::GgmlDType;
use candle::DType;

use crate::Error;

/// The part of the network a linear layer belongs to.
///
/// Mixed modes such as `gguf_q4k_m` keep more precision on a few sensitive
/// projections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinearRole {
    AttentionQkv,
    AttentionValue,
    AttentionOut,
    MlpUp,
    MlpDown,
    LmHead,
    Projector,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LowBit {
    /// Keep weights in f32.
    Float,
    Fp16,
    Bf16,
    SymInt4,
    AsymInt4,
    SymInt5,
    AsymInt5,
    SymInt8,
    Q2k,
    Q3k,
    Q4kS,
    Q4kM,
    Q5k,
    Q6k,
}

const NAMES: &[(&str, LowBit)] = &[
    ("float", LowBit::Float),
    ("fp32", LowBit::Float),
    ("fp16", LowBit::Fp16),
    ("bf16", LowBit::Bf16),
    ("sym_int4", LowBit::SymInt4),
    ("asym_int4", LowBit::AsymInt4),
    ("sym_int5", LowBit::SymInt5),
    ("asym_int5", LowBit::AsymInt5),
    ("sym_int8", LowBit::SymInt8),
    ("q2k", LowBit::Q2k),
    ("q3k", LowBit::Q3k),
    ("gguf_q4k_s", LowBit::Q4kS),
    ("q4k", LowBit::Q4kS),
    ("gguf_q4k_m", LowBit::Q4kM),
    ("q5k", LowBit::Q5k),
    ("q6k", LowBit::Q6k),
];

impl LowBit {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Float => "float",
            Self::Fp16 => "fp16",
            Self::Bf16 => "bf16",
            Self::SymInt4 => "sym_int4",
            Self::AsymInt4 => "asym_int4",
            Self::SymInt5 => "sym_int5",
            Self::AsymInt5 => "asym_int5",
            Self::SymInt8 => "sym_int8",
            Self::Q2k => "q2k",
            Self::Q3k => "q3k",
            Self::Q4kS => "gguf_q4k_s",
            Self::Q4kM => "gguf_q4k_m",
            Self::Q5k => "q5k",
            Self::Q6k => "q6k",
        }
    }

    pub fn supported_names() -> String {
        NAMES
            .iter()
            .map(|(name, _)| *name)
            .collect::<Vec<_>>()
            .join(", ")
    }

    pub fn is_quantized(&self) -> bool {
        self.float_dtype().is_none()
    }

    /// The float dtype the whole model runs in for non-quantized modes.
    pub fn float_dtype(&self) -> Option<DType> {
        match self {
            Self::Float => Some(DType::F32),
            Self::Fp16 => Some(DType::F16),
            Self::Bf16 => Some(DType::BF16),
            _ => None,
        }
    }

    /// The block format for a linear layer of the given role, `None` when the
    /// layer stays in float.
    pub fn ggml_dtype(&self, role: LinearRole) -> Option<GgmlDType> {
        let dtype = match self {
            Self::Float | Self::Fp16 | Self::Bf16 => return None,
            Self::SymInt4 => GgmlDType::Q4_0,
            Self::AsymInt4 => GgmlDType::Q4_1,
            Self::SymInt5 => GgmlDType::Q5_0,
            Self::AsymInt5 => GgmlDType::Q5_1,
            Self::SymInt8 => GgmlDType::Q8_0,
            Self::Q2k => GgmlDType::Q2K,
            Self::Q3k => GgmlDType::Q3K,
            Self::Q4kS => GgmlDType::Q4K,
            Self::Q4kM => match role {
                LinearRole::AttentionValue | LinearRole::MlpDown | LinearRole::LmHead => {
                    GgmlDType::Q6K
                }
                _ => GgmlDType::Q4K,
            },
            Self::Q5k => GgmlDType::Q5K,
            Self::Q6k => GgmlDType::Q6K,
        };
        Some(dtype)
    }
}

impl fmt::Display for LowBit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for LowBit {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        NAMES
            .iter()
            .find(|(name, _)| *name == lower)
            .map(|(_, mode)| *mode)
            .ok_or_else(|| Error::UnsupportedLowBit {
                name: s.to_string(),
                supported: Self::supported_names(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_round_trip() -> anyhow::Result<()> {
        for (name, mode) in NAMES {
            let parsed: LowBit = name.parse()?;
            assert_eq!(parsed, *mode);
            let reparsed: LowBit = parsed.to_string().parse()?;
            assert_eq!(reparsed, *mode);
        }
        assert_eq!("SYM_INT4".parse::<LowBit>()?, LowBit::SymInt4);
        Ok(())
    }

    #[test]
    fn formats_without_kernels_are_rejected() {
        for name in ["nf4", "nf3", "fp4", "fp8", "fp8_e4m3", "fp6", "gguf_iq2_xxs", ""] {
            match name.parse::<LowBit>() {
                Err(Error::UnsupportedLowBit { name: got, supported }) => {
                    assert_eq!(got, name);
                    assert!(supported.contains("sym_int4"));
                }
                other => panic!("{name:?} should be rejected, got {other:?}"),
            }
        }
    }

    #[test]
    fn block_formats() {
        assert_eq!(
            LowBit::SymInt4.ggml_dtype(LinearRole::MlpUp),
            Some(GgmlDType::Q4_0)
        );
        assert_eq!(
            LowBit::AsymInt5.ggml_dtype(LinearRole::AttentionQkv),
            Some(GgmlDType::Q5_1)
        );
        assert_eq!(
            LowBit::SymInt8.ggml_dtype(LinearRole::LmHead),
            Some(GgmlDType::Q8_0)
        );
        assert_eq!(LowBit::Fp16.ggml_dtype(LinearRole::MlpUp), None);
        assert_eq!(LowBit::Fp16.float_dtype(), Some(DType::F16));
        assert!(LowBit::SymInt4.is_quantized());
        assert!(!LowBit::Float.is_quantized());
    }

    #[test]
    fn q4k_m_keeps_sensitive_projections_wider() {
        let mode = LowBit::Q4kM;
        assert_eq!(
            mode.ggml_dtype(LinearRole::AttentionValue),
            Some(GgmlDType::Q6K)
        );
        assert_eq!(mode.ggml_dtype(LinearRole::MlpDown), Some(GgmlDType::Q6K));
        assert_eq!(
            mode.ggml_dtype(LinearRole::AttentionQkv),
            Some(GgmlDType::Q4K)
        );
        assert_eq!(mode.ggml_dtype(LinearRole::MlpUp), Some(GgmlDType::Q4K));
    }
}
