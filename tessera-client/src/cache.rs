//! Position cache.
//!
//! Stores known (object, positions) pairs and memoizes the resolved
//! permutations. On a topology change the resolver is replaced and the
//! memo is invalidated; the stored positions themselves survive, since an
//! object's placement digits do not depend on the topology version.

use std::collections::HashMap;

use rand::rngs::StdRng;

use tessera_core::{Positions, ReplicaId, VarId};

use crate::resolver::Resolver;

pub struct PositionCache {
    resolver: Resolver,
    positions: HashMap<VarId, Positions>,
    permutations: HashMap<VarId, Vec<ReplicaId>>,
    rng: StdRng,
}

impl PositionCache {
    #[must_use]
    pub fn new(resolver: Resolver, rng: StdRng) -> Self {
        Self {
            resolver,
            positions: HashMap::new(),
            permutations: HashMap::new(),
            rng,
        }
    }

    pub fn add_position(&mut self, var: VarId, positions: Positions) {
        self.permutations.remove(&var);
        self.positions.insert(var, positions);
    }

    #[must_use]
    pub fn get_positions(&self, var: &VarId) -> Option<&Positions> {
        self.positions.get(var)
    }

    /// The permutation ("hash codes") for `var`, memoized. `None` if the
    /// object's positions are unknown.
    pub fn hash_codes(&mut self, var: &VarId) -> Option<Vec<ReplicaId>> {
        if let Some(permutation) = self.permutations.get(var) {
            return Some(permutation.clone());
        }
        let positions = self.positions.get(var)?;
        let permutation = self.resolver.permutation(positions);
        self.permutations.insert(*var, permutation.clone());
        Some(permutation)
    }

    /// Generate and remember positions for a newly created object.
    pub fn create_positions(&mut self, var: VarId, max_len: usize) -> (Positions, Vec<ReplicaId>) {
        let (positions, permutation) = self.resolver.create_positions(&mut self.rng, max_len);
        self.positions.insert(var, positions.clone());
        self.permutations.insert(var, permutation.clone());
        (positions, permutation)
    }

    /// Adopt a new resolver (topology change), invalidating the memoized
    /// permutations.
    pub fn set_resolver(&mut self, resolver: Resolver) {
        self.resolver = resolver;
        self.permutations.clear();
    }
}
