use std::collections::VecDeque;

use candle_core::{Result, Tensor};
use rand::rngs::SmallRng;

/// One completed piece of experience. Observations are preprocessed
/// `[channels, height, width]` screen tensors; tensors are refcounted, so
/// cloning a transition is cheap. Never mutated once stored.
#[derive(Clone)]
pub struct Transition {
    pub start: Tensor,
    pub action: usize,
    pub reward: f32,
    pub end: Tensor,
}

/// The post-action half of a sampled batch, index-aligned with the starts
/// returned by [`ReplayMemory::batch_starts_including`].
pub struct OutcomeBatch {
    pub actions: Vec<usize>,
    pub rewards: Vec<f32>,
    pub ends: Tensor,
}

/// Bounded FIFO store of past transitions with uniform batch sampling.
///
/// Uniform sampling deliberately ignores insertion order: consecutive
/// frames are strongly correlated, and replaying them in arrival order
/// would bias the gradient estimates. Insertion beyond capacity evicts the
/// oldest entry, so the newest experience is always retained.
pub struct ReplayMemory {
    memory: VecDeque<Transition>,
    capacity: usize,
    batch_size: usize,
    last_batch: Vec<Transition>,
}

impl ReplayMemory {
    pub fn new(capacity: usize, batch_size: usize) -> Self {
        assert!(capacity > 0);
        assert!(batch_size > 0);
        Self {
            memory: VecDeque::with_capacity(capacity),
            capacity,
            batch_size,
            last_batch: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.memory.len()
    }

    pub fn is_empty(&self) -> bool {
        self.memory.is_empty()
    }

    /// Appends a transition, evicting the oldest when at capacity.
    /// Always succeeds.
    pub fn add(&mut self, transition: Transition) {
        if self.memory.len() >= self.capacity {
            self.memory.pop_front();
        }
        self.memory.push_back(transition);
    }

    /// Draws `min(batch_size, len)` transitions uniformly at random,
    /// without replacement, replacing the previously cached sample. An
    /// empty memory yields an empty sample, not an error.
    pub fn sample_new_batch(&mut self, rng: &mut SmallRng) {
        let amount = self.batch_size.min(self.memory.len());
        self.last_batch = rand::seq::index::sample(rng, self.memory.len(), amount)
            .into_iter()
            .map(|i| self.memory[i].clone())
            .collect();
    }

    /// Starting observations of the cached sample, with the live
    /// not-yet-sampled `pinned_start` stacked first. Pinning guarantees the
    /// freshest experience is in every learning batch regardless of
    /// sampling luck.
    pub fn batch_starts_including(&self, pinned_start: &Tensor) -> Result<Tensor> {
        let mut starts: Vec<&Tensor> = Vec::with_capacity(1 + self.last_batch.len());
        starts.push(pinned_start);
        starts.extend(self.last_batch.iter().map(|t| &t.start));
        Tensor::stack(&starts, 0)
    }

    /// Actions, rewards and end observations of the cached sample, pinned
    /// live values first. Index `i` here corresponds to index `i` of
    /// [`Self::batch_starts_including`]; callers depend on that alignment
    /// to compute per-example losses.
    pub fn batch_outcomes_including(
        &self,
        pinned_action: usize,
        pinned_reward: f32,
        pinned_end: &Tensor,
    ) -> Result<OutcomeBatch> {
        let n = 1 + self.last_batch.len();
        let mut actions = Vec::with_capacity(n);
        let mut rewards = Vec::with_capacity(n);
        let mut ends: Vec<&Tensor> = Vec::with_capacity(n);
        actions.push(pinned_action);
        rewards.push(pinned_reward);
        ends.push(pinned_end);
        for t in &self.last_batch {
            actions.push(t.action);
            rewards.push(t.reward);
            ends.push(&t.end);
        }
        Ok(OutcomeBatch {
            actions,
            rewards,
            ends: Tensor::stack(&ends, 0)?,
        })
    }
}
