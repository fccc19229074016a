use crate::grid::LANES;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LaneAssignmentStrategy {
    /// Cycle through lanes, skipping any the caller must avoid
    Sequential,
    /// Uniform choice from the injected random source
    Random,
}

impl LaneAssignmentStrategy {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "sequential" => Some(LaneAssignmentStrategy::Sequential),
            "random" => Some(LaneAssignmentStrategy::Random),
            _ => None,
        }
    }
}

/// Picks lanes for newly placed notes.
pub struct LaneAssigner {
    pub strategy: LaneAssignmentStrategy,
    next: usize,
}

impl LaneAssigner {
    pub fn new(strategy: LaneAssignmentStrategy) -> Self {
        LaneAssigner { strategy, next: 0 }
    }

    /// Any lane.
    pub fn assign<R: Rng + ?Sized>(&mut self, rng: &mut R) -> usize {
        self.assign_avoiding(rng, &[]).unwrap_or(0)
    }

    /// A lane not in `avoid`, or `None` when every lane is taken.
    pub fn assign_avoiding<R: Rng + ?Sized>(&mut self, rng: &mut R, avoid: &[usize]) -> Option<usize> {
        let free: Vec<usize> = (0..LANES).filter(|l| !avoid.contains(l)).collect();
        if free.is_empty() {
            return None;
        }

        match self.strategy {
            LaneAssignmentStrategy::Sequential => self.assign_sequential(&free),
            LaneAssignmentStrategy::Random => free.choose(rng).copied(),
        }
    }

    /// Next lane in cycle order that is free
    fn assign_sequential(&mut self, free: &[usize]) -> Option<usize> {
        for step in 0..LANES {
            let lane = (self.next + step) % LANES;
            if free.contains(&lane) {
                self.next = (lane + 1) % LANES;
                return Some(lane);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_sequential_assignment() {
        let mut rng = StdRng::seed_from_u64(0);
        let mut assigner = LaneAssigner::new(LaneAssignmentStrategy::Sequential);
        assert_eq!(assigner.assign(&mut rng), 0);
        assert_eq!(assigner.assign(&mut rng), 1);
        assert_eq!(assigner.assign(&mut rng), 2);
    }

    #[test]
    fn test_lane_wrapping() {
        let mut rng = StdRng::seed_from_u64(0);
        let mut assigner = LaneAssigner::new(LaneAssignmentStrategy::Sequential);
        let lanes: Vec<usize> = (0..8).map(|_| assigner.assign(&mut rng)).collect();
        assert_eq!(lanes[4], 0); // Wraps back to 0
        assert_eq!(lanes[7], 3);
    }

    #[test]
    fn test_sequential_skips_avoided() {
        let mut rng = StdRng::seed_from_u64(0);
        let mut assigner = LaneAssigner::new(LaneAssignmentStrategy::Sequential);
        assert_eq!(assigner.assign_avoiding(&mut rng, &[0, 1]), Some(2));
        assert_eq!(assigner.assign_avoiding(&mut rng, &[3]), Some(0));
        assert_eq!(assigner.assign_avoiding(&mut rng, &[0, 1, 2, 3]), None);
    }

    #[test]
    fn test_random_is_seeded_and_respects_avoid() {
        let run = |seed| {
            let mut rng = StdRng::seed_from_u64(seed);
            let mut assigner = LaneAssigner::new(LaneAssignmentStrategy::Random);
            (0..32)
                .map(|_| assigner.assign_avoiding(&mut rng, &[1]).unwrap())
                .collect::<Vec<_>>()
        };
        let first = run(42);
        assert_eq!(first, run(42));
        assert!(first.iter().all(|&l| l != 1 && l < LANES));
    }
}
