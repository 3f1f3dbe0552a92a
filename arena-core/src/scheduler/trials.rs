//! Trial order generation
//!
//! A block expands into conditions × repetitions trials. Randomization
//! permutes the list but never changes how often each condition appears.

use std::collections::BTreeMap;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::config::{BlockConfig, ProtocolError, RandomizeMode};

/// One resolved trial
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialRecord {
    /// Position in the run (0-based)
    pub index: usize,
    /// Condition this trial presents
    pub condition_id: u32,
    /// Pattern shown
    pub pattern_id: u16,
    /// Display duration in seconds
    pub duration_s: f64,
    /// How many earlier trials presented the same condition
    pub repetition: u32,
    /// True for every presentation after the first
    pub repeat: bool,
}

/// A resolved trial sequence, persisted verbatim at run end
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialOrder {
    /// Policy used to order the trials
    pub randomize: RandomizeMode,
    /// Seed used for the permutation (absent when not randomized)
    #[serde(default)]
    pub seed: Option<u64>,
    /// Trials in presentation order
    #[serde(rename = "trial", default)]
    pub trials: Vec<TrialRecord>,
}

/// Draw a seed that survives a round trip through TOML integers
pub fn fresh_seed() -> u64 {
    rand::thread_rng().gen_range(0..=i64::MAX as u64)
}

/// Expand a block into condition indices, before any permutation
fn expand(block: &BlockConfig) -> Vec<usize> {
    let mut order = Vec::with_capacity(block.trial_count());
    for _ in 0..block.repetitions {
        order.extend(0..block.conditions.len());
    }
    order
}

/// Build the trial order for a block
///
/// `seed` overrides the block's own seed; when neither is set and the block
/// is randomized, a fresh seed is drawn and recorded.
pub fn build_trial_order(block: &BlockConfig, seed: Option<u64>) -> TrialOrder {
    let mut order = expand(block);

    let seed = match block.randomize {
        RandomizeMode::None => None,
        RandomizeMode::Full | RandomizeMode::PerRepetition => {
            Some(seed.or(block.seed).unwrap_or_else(fresh_seed))
        }
    };

    if let Some(seed) = seed {
        let mut rng = StdRng::seed_from_u64(seed);
        match block.randomize {
            RandomizeMode::Full => order.shuffle(&mut rng),
            RandomizeMode::PerRepetition => {
                for chunk in order.chunks_mut(block.conditions.len()) {
                    chunk.shuffle(&mut rng);
                }
            }
            RandomizeMode::None => {}
        }
    }

    let mut seen: BTreeMap<u32, u32> = BTreeMap::new();
    let trials = order
        .into_iter()
        .enumerate()
        .map(|(index, cond_index)| {
            let condition = &block.conditions[cond_index];
            let count = seen.entry(condition.id).or_insert(0);
            let repetition = *count;
            *count += 1;
            TrialRecord {
                index,
                condition_id: condition.id,
                pattern_id: condition.display.pattern_id,
                duration_s: condition.display.duration_s,
                repetition,
                repeat: repetition > 0,
            }
        })
        .collect();

    TrialOrder {
        randomize: block.randomize,
        seed,
        trials,
    }
}

impl TrialOrder {
    /// Number of trials
    pub fn len(&self) -> usize {
        self.trials.len()
    }

    /// True if there are no trials
    pub fn is_empty(&self) -> bool {
        self.trials.is_empty()
    }

    /// How often each condition appears
    pub fn condition_counts(&self) -> BTreeMap<u32, u32> {
        let mut counts = BTreeMap::new();
        for trial in &self.trials {
            *counts.entry(trial.condition_id).or_insert(0) += 1;
        }
        counts
    }

    /// Check that a recorded order presents exactly the block's trials
    pub fn check_against(&self, block: &BlockConfig) -> Result<(), ProtocolError> {
        let expected: BTreeMap<u32, u32> = block
            .conditions
            .iter()
            .map(|c| (c.id, block.repetitions))
            .collect();
        if self.condition_counts() != expected {
            return Err(ProtocolError::ReplayMismatch(
                "condition counts differ from conditions × repetitions".to_string(),
            ));
        }

        for (i, trial) in self.trials.iter().enumerate() {
            if trial.index != i {
                return Err(ProtocolError::ReplayMismatch(format!(
                    "trial at position {} is numbered {}",
                    i, trial.index
                )));
            }
            // Counts matched, so every id is a declared condition
            if let Some(condition) = block.condition(trial.condition_id) {
                if condition.display.pattern_id != trial.pattern_id {
                    return Err(ProtocolError::ReplayMismatch(format!(
                        "trial {} shows pattern {} but condition {} uses {}",
                        i, trial.pattern_id, condition.id, condition.display.pattern_id
                    )));
                }
            }
        }
        Ok(())
    }

    /// Serialize as a TOML document
    pub fn to_toml_string(&self) -> Result<String, toml::ser::Error> {
        toml::to_string(self)
    }

    /// Parse a TOML document written by [`TrialOrder::to_toml_string`]
    pub fn from_toml_str(input: &str) -> Result<Self, ProtocolError> {
        toml::from_str(input).map_err(|e| ProtocolError::Parse(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Condition, DisplaySpec, ParamMap};

    fn make_condition(id: u32, pattern_id: u16) -> Condition {
        Condition {
            id,
            display: DisplaySpec {
                pattern_id,
                duration_s: 2.0,
                frame_rate: 10,
                gs_level: None,
                repeat_count: 0,
                start_frame: 0,
                wait_for_completion: true,
            },
            action: None,
            params: ParamMap::new(),
            frame: None,
            extra: Default::default(),
        }
    }

    fn make_block(conditions: u32, repetitions: u32, randomize: RandomizeMode) -> BlockConfig {
        BlockConfig {
            repetitions,
            randomize,
            seed: None,
            conditions: (1..=conditions).map(|id| make_condition(id, id as u16 + 100)).collect(),
        }
    }

    fn ids(order: &TrialOrder) -> Vec<u32> {
        order.trials.iter().map(|t| t.condition_id).collect()
    }

    #[test]
    fn test_sequential_order() {
        let block = make_block(3, 2, RandomizeMode::None);
        let order = build_trial_order(&block, None);

        assert_eq!(ids(&order), vec![1, 2, 3, 1, 2, 3]);
        assert_eq!(order.seed, None);
        assert_eq!(order.trials[4].pattern_id, 102);
        assert_eq!(order.trials[4].repetition, 1);
        assert!(order.trials[4].repeat);
        assert!(!order.trials[0].repeat);
    }

    #[test]
    fn test_trial_count_and_multiset() {
        let block = make_block(5, 4, RandomizeMode::Full);
        let order = build_trial_order(&block, None);

        assert_eq!(order.len(), 20);
        assert!(order.condition_counts().values().all(|&n| n == 4));
        assert!(order.check_against(&block).is_ok());
        assert!(order.seed.is_some());
    }

    #[test]
    fn test_indices_are_positions() {
        let block = make_block(4, 3, RandomizeMode::Full);
        let order = build_trial_order(&block, Some(7));
        for (i, trial) in order.trials.iter().enumerate() {
            assert_eq!(trial.index, i);
        }
    }

    #[test]
    fn test_seeded_order_is_reproducible() {
        let block = make_block(6, 3, RandomizeMode::Full);
        let a = build_trial_order(&block, Some(1234));
        let b = build_trial_order(&block, Some(1234));
        assert_eq!(a, b);
    }

    #[test]
    fn test_block_seed_used_when_no_override() {
        let mut block = make_block(6, 3, RandomizeMode::Full);
        block.seed = Some(99);
        let order = build_trial_order(&block, None);
        assert_eq!(order.seed, Some(99));
        assert_eq!(order, build_trial_order(&block, Some(99)));
    }

    #[test]
    fn test_unseeded_runs_differ() {
        // 10 conditions x 3 reps: a repeated permutation is vanishingly unlikely
        let block = make_block(10, 3, RandomizeMode::Full);
        let a = build_trial_order(&block, None);
        let b = build_trial_order(&block, None);
        assert_ne!(ids(&a), ids(&b));
    }

    #[test]
    fn test_per_repetition_keeps_each_rep_complete() {
        let block = make_block(5, 4, RandomizeMode::PerRepetition);
        let order = build_trial_order(&block, Some(5));

        for rep in ids(&order).chunks(5) {
            let mut sorted = rep.to_vec();
            sorted.sort_unstable();
            assert_eq!(sorted, vec![1, 2, 3, 4, 5]);
        }
    }

    #[test]
    fn test_repetition_numbers_follow_presentation_order() {
        let block = make_block(3, 3, RandomizeMode::Full);
        let order = build_trial_order(&block, Some(42));

        let mut seen = BTreeMap::new();
        for trial in &order.trials {
            let n = seen.entry(trial.condition_id).or_insert(0u32);
            assert_eq!(trial.repetition, *n);
            *n += 1;
        }
    }

    #[test]
    fn test_toml_roundtrip_for_replay() {
        let block = make_block(3, 2, RandomizeMode::Full);
        let order = build_trial_order(&block, Some(8));

        let text = order.to_toml_string().unwrap();
        assert!(text.contains("[[trial]]"));

        let parsed = TrialOrder::from_toml_str(&text).unwrap();
        assert_eq!(parsed, order);
        assert!(parsed.check_against(&block).is_ok());
    }

    #[test]
    fn test_replay_mismatch_detected() {
        let block = make_block(3, 2, RandomizeMode::None);
        let mut order = build_trial_order(&block, None);
        order.trials.pop();
        assert!(matches!(
            order.check_against(&block),
            Err(ProtocolError::ReplayMismatch(_))
        ));

        let mut order = build_trial_order(&block, None);
        order.trials[0].pattern_id = 999;
        assert!(matches!(
            order.check_against(&block),
            Err(ProtocolError::ReplayMismatch(_))
        ));
    }

    #[test]
    fn test_fresh_seed_fits_toml() {
        for _ in 0..100 {
            assert!(fresh_seed() <= i64::MAX as u64);
        }
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn prop_multiset_preserved(
                conditions in 1u32..12,
                reps in 1u32..6,
                seed in 0u64..1_000_000,
                mode in prop_oneof![
                    Just(RandomizeMode::None),
                    Just(RandomizeMode::Full),
                    Just(RandomizeMode::PerRepetition)
                ],
            ) {
                let block = make_block(conditions, reps, mode);
                let order = build_trial_order(&block, Some(seed));
                prop_assert_eq!(order.len(), (conditions * reps) as usize);
                prop_assert!(order.condition_counts().values().all(|&n| n == reps));
                prop_assert_eq!(order.condition_counts().len(), conditions as usize);
            }
        }
    }
}
