use ndarray::{Array3, ArrayViewD, ArrayViewMutD};

use crate::errors::Result;

/// Read-only visitor over named parameters
pub type ParamVisitor<'v> = dyn FnMut(&str, ArrayViewD<'_, f32>) + 'v;

/// Mutating visitor over named parameters, used by external optimizers
pub type ParamVisitorMut<'v> = dyn FnMut(&str, ArrayViewMutD<'_, f32>) + 'v;

/// A token-mixing or channel-mixing stage: `[B, T, H] -> [B, T, H]`.
pub trait Layer {
    fn layer_type(&self) -> &str;

    fn forward(&mut self, input: &Array3<f32>) -> Result<Array3<f32>>;

    /// Number of scalar parameters
    fn parameters(&self) -> usize;

    fn set_training(&mut self, training: bool);

    fn visit_parameters(&self, prefix: &str, visitor: &mut ParamVisitor<'_>);

    fn visit_parameters_mut(&mut self, prefix: &str, visitor: &mut ParamVisitorMut<'_>);
}

/// Join a parameter path the way `state_dict` keys are spelled
pub(crate) fn join(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{}.{}", prefix, name)
    }
}
