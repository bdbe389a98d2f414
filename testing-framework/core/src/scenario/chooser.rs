use rand::Rng;

use super::{error::ConfigError, transitions::Distribution};

/// Picks the next state from a [`Distribution`] using a caller-supplied
/// random source, so a seeded source replays the same choices.
#[derive(Clone, Copy, Debug, Default)]
pub struct WeightedRandomChooser;

impl WeightedRandomChooser {
    /// Draws uniformly in `[0, total)` and returns the first state whose
    /// cumulative weight exceeds the draw. Zero-weight entries are never
    /// returned while any entry is positive.
    pub fn choose<'a, R>(distribution: &'a Distribution, rng: &mut R) -> Result<&'a str, ConfigError>
    where
        R: Rng + ?Sized,
    {
        let total = distribution.total_weight();
        if !total.is_finite() || total <= 0.0 {
            return Err(ConfigError::ZeroWeightDistribution {
                states: distribution
                    .entries()
                    .iter()
                    .map(|(state, _)| state.clone())
                    .collect(),
            });
        }

        let draw = rng.gen_range(0.0..total);
        let mut cumulative = 0.0;
        let mut last_positive = None;

        for (state, weight) in distribution.entries() {
            if *weight <= 0.0 {
                continue;
            }
            cumulative += weight;
            last_positive = Some(state.as_str());
            if cumulative > draw {
                return Ok(state);
            }
        }

        // Floating point rounding can leave the final cumulative sum a hair
        // below the draw.
        last_positive.ok_or_else(|| ConfigError::ZeroWeightDistribution {
            states: Vec::new(),
        })
    }
}
