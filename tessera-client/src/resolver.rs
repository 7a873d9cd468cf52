//! Consistent-hash resolver.
//!
//! A [`Positions`] value is a string of permutation digits: digit `i`
//! selects one replica from those not yet chosen (`index = digit mod
//! remaining`). The same digits against the same replica list always yield
//! the same permutation, and the first `two_f_inc` entries of an object's
//! permutation are the replicas responsible for it.

use rand::Rng;
use rand::rngs::StdRng;

use tessera_core::{Positions, ReplicaId};

/// Resolves position digits to replica permutations for one topology.
#[derive(Debug, Clone)]
pub struct Resolver {
    replicas: Vec<ReplicaId>,
}

impl Resolver {
    #[must_use]
    pub fn new(replicas: &[ReplicaId]) -> Self {
        Self {
            replicas: replicas.to_vec(),
        }
    }

    /// Reconstruct the permutation encoded by `positions`.
    ///
    /// The permutation's length is `min(positions.len(), replica_count)`.
    #[must_use]
    pub fn permutation(&self, positions: &Positions) -> Vec<ReplicaId> {
        let mut remaining = self.replicas.clone();
        let mut permutation = Vec::with_capacity(remaining.len().min(positions.len()));
        for &digit in positions.digits() {
            if remaining.is_empty() {
                break;
            }
            let idx = usize::from(digit) % remaining.len();
            permutation.push(remaining.remove(idx));
        }
        permutation
    }

    /// Generate fresh positions for a newly created object, of length
    /// `min(max_len, replica_count)`, together with the permutation they
    /// encode.
    #[must_use]
    pub fn create_positions(&self, rng: &mut StdRng, max_len: usize) -> (Positions, Vec<ReplicaId>) {
        let n = self.replicas.len();
        let len = n.min(max_len);
        let mut digits = Vec::with_capacity(len);
        for i in 0..len {
            let bound = u8::try_from(n - i).unwrap_or(u8::MAX);
            digits.push(rng.random_range(0..bound));
        }
        let positions = Positions(digits);
        let permutation = self.permutation(&positions);
        (positions, permutation)
    }
}
