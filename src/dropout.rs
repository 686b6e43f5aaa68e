use ndarray::{Array, Dimension};
use rand::Rng;

use crate::errors::{ModelError, Result};

/// Inverted dropout: during training each element is zeroed with probability
/// `rate` and survivors are scaled by `1 / (1 - rate)`. Identity otherwise.
#[derive(Clone, Debug)]
pub struct Dropout {
    rate: f32,
    training: bool,
}

impl Dropout {
    pub fn new(rate: f32) -> Result<Self> {
        if !(0.0..1.0).contains(&rate) {
            return Err(ModelError::InvalidArgument {
                message: format!("dropout rate must be in [0, 1), got {}", rate),
            });
        }
        Ok(Self {
            rate,
            training: false,
        })
    }

    pub fn rate(&self) -> f32 {
        self.rate
    }

    pub fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    pub fn forward<D: Dimension>(&self, mut input: Array<f32, D>) -> Array<f32, D> {
        if !self.training || self.rate == 0.0 {
            return input;
        }

        let mut rng = rand::rng();
        let scale = 1.0 / (1.0 - self.rate);
        input.mapv_inplace(|x| {
            if rng.random::<f32>() < self.rate {
                0.0
            } else {
                x * scale
            }
        });
        input
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    #[test]
    fn test_dropout_identity_in_eval() {
        let dropout = Dropout::new(0.5).unwrap();
        let input = Array2::from_elem((4, 4), 3.0);
        assert_eq!(dropout.forward(input.clone()), input);
    }

    #[test]
    fn test_dropout_zeroes_and_scales_in_training() {
        let mut dropout = Dropout::new(0.5).unwrap();
        dropout.set_training(true);
        let out = dropout.forward(Array2::<f32>::ones((64, 64)));
        assert!(out.iter().all(|&x| x == 0.0 || x == 2.0));
        let zeros = out.iter().filter(|&&x| x == 0.0).count();
        assert!(zeros > 1500 && zeros < 2600, "zeroed {}", zeros);
    }

    #[test]
    fn test_invalid_rate() {
        assert!(Dropout::new(1.0).is_err());
        assert!(Dropout::new(-0.1).is_err());
    }
}
