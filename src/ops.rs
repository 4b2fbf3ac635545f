//! Tensor helpers shared by the layers
//!
//! Activations candle does not ship (ReLU6, leaky ReLU, softplus), guarded
//! division and rank-agnostic application of 2-D modules.

use crate::VrnnResult;
use candle_core::{Module, Tensor, D};

/// Bounded rectifier: `min(max(x, 0), 6)`
pub fn relu6(x: &Tensor) -> VrnnResult<Tensor> {
    Ok(x.clamp(0f32, 6f32)?)
}

/// Leaky rectifier for `0 <= slope < 1`
pub fn leaky_relu(x: &Tensor, slope: f64) -> VrnnResult<Tensor> {
    Ok(x.maximum(&(x * slope)?)?)
}

/// Beyond this `|x|`, `1 + e^-|x|` rounds to 1 in f32 and the softplus tail
/// is taken as `e^-|x|` directly
const SOFTPLUS_TAIL_CUTOFF: f32 = 15.0;

/// Numerically stable `ln(1 + e^x)`, strictly positive wherever `e^x` is
/// representable
pub fn softplus(x: &Tensor) -> VrnnResult<Tensor> {
    let neg_abs = x.abs()?.neg()?;
    let small = neg_abs.exp()?;
    let log1p = small.affine(1.0, 1.0)?.log()?;
    let far = neg_abs.lt(-SOFTPLUS_TAIL_CUTOFF)?;
    let tail = far.where_cond(&small, &log1p)?;
    Ok((x.relu()? + tail)?)
}

/// Euclidean norm over the last axis (axis removed)
pub fn norm_last(x: &Tensor) -> VrnnResult<Tensor> {
    Ok(x.sqr()?.sum(D::Minus1)?.sqrt()?)
}

/// Elementwise `num / den`, exactly 0 wherever `den == 0`
pub fn safe_div(num: &Tensor, den: &Tensor) -> VrnnResult<Tensor> {
    let nonzero = den.ne(0f32)?;
    let safe_den = nonzero.where_cond(den, &den.ones_like()?)?;
    let quotient = (num / safe_den)?;
    Ok(nonzero.where_cond(&quotient, &quotient.zeros_like()?)?)
}

/// Apply a module that expects `rows x features` to a tensor of any rank
pub fn forward_flat<M: Module>(module: &M, x: &Tensor) -> VrnnResult<Tensor> {
    let dims = x.dims().to_vec();
    let (lead, last) = dims.split_at(dims.len().saturating_sub(1));
    let width = last.first().copied().unwrap_or(1);
    let rows: usize = lead.iter().product();
    let out = module.forward(&x.reshape((rows, width))?)?;
    let mut out_dims = lead.to_vec();
    out_dims.push(out.dim(1)?);
    Ok(out.reshape(out_dims)?)
}
