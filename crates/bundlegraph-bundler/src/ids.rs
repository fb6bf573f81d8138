use rand::distr::Alphanumeric;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use bundlegraph_core::{BundlerSettings, IdStrategy, LocalId};

/// Source of fresh local ids. Bundling asks for another id whenever the
/// one drawn is already taken in the target bundle.
pub trait LocalIdGenerator: Send {
    fn next_id(&mut self) -> LocalId;
}

/// Random alphanumeric ids.
#[derive(Debug)]
pub struct ShortIdGenerator {
    length: usize,
    rng: StdRng,
}

impl ShortIdGenerator {
    pub fn new(length: usize) -> Self {
        Self {
            length,
            rng: StdRng::from_os_rng(),
        }
    }

    /// Deterministic sequence, for reproducible output.
    pub fn seeded(length: usize, seed: u64) -> Self {
        Self {
            length,
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl Default for ShortIdGenerator {
    fn default() -> Self {
        Self::new(12)
    }
}

impl LocalIdGenerator for ShortIdGenerator {
    fn next_id(&mut self) -> LocalId {
        (&mut self.rng)
            .sample_iter(Alphanumeric)
            .take(self.length)
            .map(char::from)
            .collect()
    }
}

/// Yields "0", "1", "2", ...
#[derive(Debug, Default, Clone)]
pub struct SequentialIdGenerator {
    next: u64,
}

impl SequentialIdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn starting_at(next: u64) -> Self {
        Self { next }
    }
}

impl LocalIdGenerator for SequentialIdGenerator {
    fn next_id(&mut self) -> LocalId {
        let id = self.next.to_string();
        self.next += 1;
        id
    }
}

pub fn generator_for(settings: &BundlerSettings) -> Box<dyn LocalIdGenerator> {
    match settings.id_strategy {
        IdStrategy::Short => Box::new(ShortIdGenerator::new(settings.id_length)),
        IdStrategy::Sequential => Box::new(SequentialIdGenerator::new()),
    }
}
