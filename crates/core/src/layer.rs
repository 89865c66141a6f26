//! The capability every weighted component of the network exposes.

use candle_core::{Result, Tensor};

/// Forward evaluation, parameter access and L2 contribution.
///
/// Implemented by [`QConv2d`](crate::conv::QConv2d), [`Dense`](crate::model::Dense),
/// [`ResidualUnit`](crate::block::ResidualUnit),
/// [`ResidualBlock`](crate::block::ResidualBlock) and
/// [`QResNet20`](crate::model::QResNet20). Composite layers sum the penalties
/// of their children.
pub trait Layer {
    /// `train` selects batch statistics (and running-stat updates) in
    /// normalization layers; layers without such state ignore it.
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor>;

    /// Trainable tensors owned by this layer (shared handles, not copies).
    fn parameters(&self) -> Vec<Tensor>;

    /// Scalar penalty added to the training loss.
    fn regularization_loss(&self) -> Result<Tensor>;
}

/// `weight_decay · Σ w²`.
pub fn l2_penalty(weight: &Tensor, weight_decay: f64) -> Result<Tensor> {
    weight.sqr()?.sum_all()?.affine(weight_decay, 0.0)
}

/// Sum scalar penalties. `terms` must be non-empty.
pub(crate) fn sum_penalties(terms: impl IntoIterator<Item = Result<Tensor>>) -> Result<Tensor> {
    let mut total: Option<Tensor> = None;
    for term in terms {
        let term = term?;
        total = Some(match total {
            None => term,
            Some(prev) => (prev + term)?,
        });
    }
    total.ok_or_else(|| candle_core::Error::Msg("no regularization terms".to_string()))
}
