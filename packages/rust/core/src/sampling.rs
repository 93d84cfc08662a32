//! Tiered random selection of atoms for verification.

use rand::SeedableRng;
use rand::rngs::StdRng;
use skillfactory_shared::QualityTier;

/// Number of atoms to verify: `max(1, floor(n * fraction))`, never more than `n`.
pub fn sample_size(n: usize, tier: QualityTier) -> usize {
    if n == 0 {
        return 0;
    }
    ((n as f64 * tier.sample_fraction()).floor() as usize).clamp(1, n)
}

/// Sorted indices of the atoms to verify. A fixed seed gives the same
/// selection every run; `None` seeds from entropy.
pub fn sample_indices(n: usize, tier: QualityTier, seed: Option<u64>) -> Vec<usize> {
    let size = sample_size(n, tier);
    if size == n {
        return (0..n).collect();
    }
    let mut rng = match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    let mut picked = rand::seq::index::sample(&mut rng, n, size).into_vec();
    picked.sort_unstable();
    picked
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes_per_tier() {
        assert_eq!(sample_size(10, QualityTier::Draft), 3);
        assert_eq!(sample_size(10, QualityTier::Standard), 6);
        assert_eq!(sample_size(10, QualityTier::Premium), 10);
        assert_eq!(sample_size(2, QualityTier::Draft), 1);
        assert_eq!(sample_size(0, QualityTier::Premium), 0);
    }

    #[test]
    fn premium_takes_everything() {
        assert_eq!(sample_indices(5, QualityTier::Premium, None), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn seeded_sampling_is_reproducible() {
        let a = sample_indices(50, QualityTier::Standard, Some(7));
        let b = sample_indices(50, QualityTier::Standard, Some(7));
        assert_eq!(a, b);
        assert_eq!(a.len(), 30);
        assert!(a.windows(2).all(|w| w[0] < w[1]));
        assert!(a.iter().all(|&i| i < 50));
    }
}
