//! Weight collections flowing through a conversion

use std::collections::BTreeMap;
use std::fmt;

use crate::tensor::Tensor;

/// Named tensors, ordered by name for deterministic iteration and output.
pub type StateDict = BTreeMap<String, Tensor>;

/// The complete unsharded model.
pub type FullState = StateDict;

/// One `(tp_rank, pp_rank)` fragment of a sharded model.
pub type PartialState = StateDict;

/// Position of one partial checkpoint in the TP x PP grid.
///
/// Ordered by `pp_rank` first so iteration visits each pipeline stage's
/// ranks together, in `tp_rank` order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RankCoord {
    pub pp_rank: usize,
    pub tp_rank: usize,
}

impl RankCoord {
    #[must_use]
    pub fn new(tp_rank: usize, pp_rank: usize) -> Self {
        Self { pp_rank, tp_rank }
    }

    /// Every coordinate of a `tp_size x pp_size` grid, `pp_rank`-major.
    pub fn grid(tp_size: usize, pp_size: usize) -> impl Iterator<Item = Self> {
        (0..pp_size).flat_map(move |pp| (0..tp_size).map(move |tp| Self::new(tp, pp)))
    }
}

impl fmt::Display for RankCoord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tp_rank {:02} pp_rank {:02}", self.tp_rank, self.pp_rank)
    }
}

/// Every partial of a sharded checkpoint, keyed by rank.
pub type PartialSet = BTreeMap<RankCoord, PartialState>;
