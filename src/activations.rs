use ndarray::{ArrayBase, Array, DataMut, Dimension};
use serde::{Deserialize, Serialize};

/// Nonlinearities available to the feed-forward blocks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
    #[default]
    Gelu,
    Relu,
    Swish,
}

impl Activation {
    #[inline]
    pub fn apply_scalar(self, x: f32) -> f32 {
        match self {
            Activation::Gelu => gelu(x),
            Activation::Relu => x.max(0.0),
            Activation::Swish => swish(x),
        }
    }

    /// Apply the nonlinearity element-wise, in place
    pub fn apply_inplace<S, D>(self, x: &mut ArrayBase<S, D>)
    where
        S: DataMut<Elem = f32>,
        D: Dimension,
    {
        x.mapv_inplace(|v| self.apply_scalar(v));
    }

    pub fn apply<D: Dimension>(self, mut x: Array<f32, D>) -> Array<f32, D> {
        self.apply_inplace(&mut x);
        x
    }
}

/// Swish activation function (also known as SiLU)
///
/// Swish(x) = x * sigmoid(x) = x * (1 / (1 + e^{-x}))
#[inline]
pub fn swish(x: f32) -> f32 {
    x / (1.0 + (-x).exp())
}

/// Exact GELU: 0.5 * x * (1 + erf(x / sqrt(2)))
#[inline]
pub fn gelu(x: f32) -> f32 {
    0.5 * x * (1.0 + erf(x * std::f32::consts::FRAC_1_SQRT_2))
}

/// Error function, Numerical Recipes `erfc` Chebyshev fit (|error| < 1.2e-7)
pub fn erf(x: f32) -> f32 {
    let z = f64::from(x).abs();
    let t = 1.0 / (1.0 + 0.5 * z);
    let poly = -z * z - 1.265_512_23
        + t * (1.000_023_68
            + t * (0.374_091_96
                + t * (0.096_784_18
                    + t * (-0.186_288_06
                        + t * (0.278_868_07
                            + t * (-1.135_203_98
                                + t * (1.488_515_87
                                    + t * (-0.822_152_23 + t * 0.170_872_77))))))));
    let erfc = t * poly.exp();
    let result = if x >= 0.0 { 1.0 - erfc } else { erfc - 1.0 };
    result as f32
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_erf_reference_values() {
        assert_abs_diff_eq!(erf(0.0), 0.0, epsilon = 1e-6);
        assert_abs_diff_eq!(erf(0.5), 0.520_499_9, epsilon = 1e-6);
        assert_abs_diff_eq!(erf(1.0), 0.842_700_8, epsilon = 1e-6);
        assert_abs_diff_eq!(erf(-2.0), -0.995_322_3, epsilon = 1e-6);
    }

    #[test]
    fn test_gelu_reference_values() {
        assert_abs_diff_eq!(gelu(0.0), 0.0, epsilon = 1e-7);
        assert_abs_diff_eq!(gelu(1.0), 0.841_344_7, epsilon = 1e-6);
        assert_abs_diff_eq!(gelu(-1.0), -0.158_655_3, epsilon = 1e-6);
        assert_abs_diff_eq!(gelu(3.0), 2.995_950_5, epsilon = 1e-5);
    }

    #[test]
    fn test_relu_and_swish() {
        assert_eq!(Activation::Relu.apply_scalar(-2.0), 0.0);
        assert_eq!(Activation::Relu.apply_scalar(2.0), 2.0);
        assert_abs_diff_eq!(Activation::Swish.apply_scalar(1.0), 0.731_058_6, epsilon = 1e-6);
    }
}
