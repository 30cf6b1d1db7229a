//! Layers wrapped with tracing spans, plus the linear layer that carries the
//! low-bit transform.

use candle::quantized::{QMatMul, QTensor};
use candle::{DType, Module, Result, Tensor};
use candle_nn::VarBuilder;

use crate::low_bit::{LinearRole, LowBit};

enum LinearInner {
    Float(candle_nn::Linear),
    Quantized {
        weight: QMatMul,
        bias: Option<Tensor>,
    },
}

/// A linear layer whose weight is either kept in the var-builder dtype or
/// quantized to a GGML block format at load time.
pub struct QLinear {
    inner: LinearInner,
    span: tracing::Span,
}

impl QLinear {
    pub fn from_weights(weight: Tensor, bias: Option<Tensor>) -> Self {
        let span = tracing::span!(tracing::Level::TRACE, "linear");
        Self {
            inner: LinearInner::Float(candle_nn::Linear::new(weight, bias)),
            span,
        }
    }

    /// Quantizes `weight`, stored as `(out_dim, in_dim)`.
    pub fn quantize(
        weight: &Tensor,
        bias: Option<Tensor>,
        dtype: candle::quantized::GgmlDType,
    ) -> Result<Self> {
        let span = tracing::span!(tracing::Level::TRACE, "qmatmul");
        let weight = QMatMul::from_qtensor(QTensor::quantize(weight, dtype)?)?;
        let bias = bias.map(|b| b.to_dtype(DType::F32)).transpose()?;
        Ok(Self {
            inner: LinearInner::Quantized { weight, bias },
            span,
        })
    }

    pub fn is_quantized(&self) -> bool {
        matches!(self.inner, LinearInner::Quantized { .. })
    }
}

impl Module for QLinear {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let _enter = self.span.enter();
        match &self.inner {
            LinearInner::Float(linear) => linear.forward(xs),
            LinearInner::Quantized { weight, bias } => {
                let in_dtype = xs.dtype();
                let xs = weight.forward(&xs.to_dtype(DType::F32)?.contiguous()?)?;
                let xs = match bias {
                    None => xs,
                    Some(bias) => xs.broadcast_add(bias)?,
                };
                xs.to_dtype(in_dtype)
            }
        }
    }
}

impl std::fmt::Debug for QLinear {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.inner {
            LinearInner::Float(linear) => write!(f, "QLinear(float {:?})", linear.weight().shape()),
            LinearInner::Quantized { .. } => write!(f, "QLinear(quantized)"),
        }
    }
}

/// Loads a linear layer, quantizing it when `low_bit` asks for it and the
/// input dimension fits the block size.
pub fn qlinear_b(
    in_dim: usize,
    out_dim: usize,
    bias: bool,
    role: LinearRole,
    low_bit: LowBit,
    vb: VarBuilder,
) -> Result<QLinear> {
    if let Some(ggml_dtype) = low_bit.ggml_dtype(role) {
        if in_dim % ggml_dtype.block_size() == 0 {
            let weight = vb.get_with_hints_dtype(
                (out_dim, in_dim),
                "weight",
                Default::default(),
                DType::F32,
            )?;
            let bias = if bias {
                Some(vb.get_with_hints_dtype(out_dim, "bias", Default::default(), DType::F32)?)
            } else {
                None
            };
            return QLinear::quantize(&weight, bias, ggml_dtype);
        }
        tracing::debug!(
            prefix = %vb.prefix(),
            in_dim,
            block_size = ggml_dtype.block_size(),
            "input dim not a multiple of the block size, keeping float weights"
        );
    }
    let weight = vb.get((out_dim, in_dim), "weight")?;
    let bias = if bias {
        Some(vb.get(out_dim, "bias")?)
    } else {
        None
    };
    Ok(QLinear::from_weights(weight, bias))
}

#[derive(Debug, Clone)]
pub struct RmsNorm {
    inner: candle_nn::RmsNorm,
    span: tracing::Span,
}

impl RmsNorm {
    pub fn new(size: usize, eps: f64, vb: VarBuilder) -> Result<Self> {
        let span = tracing::span!(tracing::Level::TRACE, "rms-norm");
        let inner = candle_nn::rms_norm(size, eps, vb)?;
        Ok(Self { inner, span })
    }
}

impl Module for RmsNorm {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let _enter = self.span.enter();
        self.inner.forward(xs)
    }
}

#[derive(Debug, Clone)]
pub struct LayerNorm {
    inner: candle_nn::LayerNorm,
    span: tracing::Span,
}

impl LayerNorm {
    pub fn new(size: usize, vb: VarBuilder) -> Result<Self> {
        let span = tracing::span!(tracing::Level::TRACE, "layer-norm");
        let inner = candle_nn::layer_norm(size, 1e-5, vb)?;
        Ok(Self { inner, span })
    }
}

impl Module for LayerNorm {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let _enter = self.span.enter();
        self.inner.forward(xs)
    }
}
