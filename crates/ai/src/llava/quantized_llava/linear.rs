use candle_core::{
    quantized::{GgmlDType, QMatMul},
    DType, Module, Tensor,
};
use candle_transformers::quantized_var_builder;

/// Linear layer over gguf weights.
///
/// Quantized weights stay quantized and are multiplied in f32. Float
/// weights (the f16 mmproj) are dequantized once to `dtype` and the
/// layer then computes in that dtype.
#[derive(Debug, Clone)]
pub struct QLinear {
    inner: QMatMul,
    bias: Tensor,
    span: tracing::Span,
}

impl QLinear {
    pub fn load(
        in_dim: usize,
        out_dim: usize,
        vb: quantized_var_builder::VarBuilder,
        dtype: DType,
    ) -> candle_core::Result<Self> {
        let weight = vb.get((out_dim, in_dim), "weight")?;
        let inner = match weight.dtype() {
            GgmlDType::F32 | GgmlDType::F16 | GgmlDType::BF16 => {
                QMatMul::Tensor(weight.dequantize(vb.device())?.to_dtype(dtype)?)
            }
            _ => QMatMul::from_arc(weight)?,
        };
        let bias = vb.get(out_dim, "bias")?;
        let bias = bias.dequantize(vb.device())?.to_dtype(dtype)?;
        let span = tracing::span!(tracing::Level::TRACE, "qmatmul");
        Ok(Self { inner, bias, span })
    }
}

impl Module for QLinear {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let _enter = self.span.enter();
        let ys = match &self.inner {
            QMatMul::QTensor(_) => self
                .inner
                .forward(&xs.to_dtype(DType::F32)?)?
                .to_dtype(xs.dtype())?,
            _ => self.inner.forward(xs)?,
        };
        ys.broadcast_add(&self.bias)
    }
}
