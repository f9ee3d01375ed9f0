use anyhow::{bail, Context, Result};
use candle_core::{Device, Tensor, D};
use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::path::PathBuf;
use tracing::{debug, info};

use crate::action::{decode, ActionLabel};
use crate::checkpoint::{self, CheckpointMeta};
use crate::env::Environment;
use crate::metrics::{Evaluator, SelectiveSummary, StepSummary};
use crate::model::{ConvQNet, QModel};
use crate::replay::{ReplayMemory, Transition};

// ==== Configuration ====

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Learn: store experience, run gradient updates, write checkpoints.
    Build,
    /// Exploit only: greedy policy, no memory, no updates, no checkpoints.
    Validate,
}

#[derive(Debug, Clone)]
pub struct TrainerConfig {
    pub mode: Mode,
    pub gamma: f64,
    pub epsilon: f64,
    pub learning_rate: f64,
    pub batch_size: usize,
    pub memory_capacity: usize,
    pub forecast_refresh_interval: u64,
    pub save_interval: u64,
    pub max_step_count: u64,
    pub checkpoint_dir: PathBuf,
    pub right_bias: f64,
    pub seed: Option<u64>,
    pub render: bool,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            mode: Mode::Build,
            gamma: 0.99,
            epsilon: 0.10,
            learning_rate: 1e-4,
            batch_size: 16,
            memory_capacity: 100_000,
            forecast_refresh_interval: 1000,
            save_interval: 10_000,
            max_step_count: 100_000,
            checkpoint_dir: PathBuf::from("model"),
            right_bias: 0.0,
            seed: None,
            render: false,
        }
    }
}

impl TrainerConfig {
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.epsilon) {
            bail!("epsilon must be within 0..=1, got {}", self.epsilon);
        }
        if !(0.0..=1.0).contains(&self.gamma) {
            bail!("gamma must be within 0..=1, got {}", self.gamma);
        }
        if self.forecast_refresh_interval == 0 {
            bail!("forecast refresh interval must be nonzero");
        }
        if self.save_interval == 0 {
            bail!("save interval must be nonzero");
        }
        if self.batch_size == 0 || self.memory_capacity == 0 {
            bail!("batch size and memory capacity must be nonzero");
        }
        Ok(())
    }
}

// ==== Policy and loss helpers ====

/// First index holding the strictly greatest value. Ties resolve to the
/// lowest index, so equal estimates give a deterministic pick.
pub(crate) fn argmax_first(values: &[f32]) -> usize {
    let mut best = 0;
    for (i, &v) in values.iter().enumerate().skip(1) {
        if v > values[best] {
            best = i;
        }
    }
    best
}

/// Explores with probability `epsilon` (uniform over all actions, the
/// greedy one included), exploits otherwise.
pub(crate) fn epsilon_greedy(q_row: &[f32], epsilon: f64, rng: &mut SmallRng) -> usize {
    if rng.random::<f64>() < epsilon {
        rng.random_range(0..q_row.len())
    } else {
        argmax_first(q_row)
    }
}

/// Regression targets: `reward + gamma * future`, with the live entry at
/// index 0 clamped to its reward alone when its step ended the episode.
/// Stored transitions carry no terminal flag, so only the pin is clamped.
pub(crate) fn observed_values(rewards: &[f32], future: &[f32], gamma: f32, live_done: bool) -> Vec<f32> {
    rewards
        .iter()
        .zip(future)
        .enumerate()
        .map(|(i, (reward, &future))| {
            let future = if i == 0 && live_done { 0.0 } else { future };
            reward + gamma * future
        })
        .collect()
}

/// Huber loss between `q_est` (`[n, actions]`) and per-example targets,
/// masked so only the taken action's slot contributes. Untaken slots see an
/// exactly zero gradient.
pub(crate) fn masked_huber_loss(
    q_est: &Tensor,
    actions: &[usize],
    observed: &[f32],
    device: &Device,
) -> candle_core::Result<Tensor> {
    let (n, action_count) = q_est.dims2()?;
    let observed = Tensor::from_vec(observed.to_vec(), (n, 1), device)?;
    let diff = q_est.broadcast_sub(&observed)?;
    let abs_diff = diff.abs()?;
    let ones = abs_diff.ones_like()?;
    let huber = abs_diff
        .lt(&ones)?
        .where_cond(&diff.sqr()?.affine(0.5, 0.0)?, &abs_diff.affine(1.0, -0.5)?)?;
    let mut mask = vec![0f32; n * action_count];
    for (i, &action) in actions.iter().enumerate() {
        mask[i * action_count + action] = 1.0;
    }
    let mask = Tensor::from_vec(mask, (n, action_count), device)?;
    huber.mul(&mask)?.sum(D::Minus1)?.mean_all()
}

// ==== Trainer ====

/// The single-actor loop: act, observe, remember, learn, summarize.
pub struct Trainer<E: Environment> {
    cfg: TrainerConfig,
    model: ConvQNet,
    forecast: ConvQNet,
    env: E,
    memory: ReplayMemory,
    optimizer: Option<AdamW>,
    evaluator: Evaluator,
    rng: SmallRng,
    device: Device,
}

impl<E: Environment> Trainer<E> {
    pub fn new(
        cfg: TrainerConfig,
        model: ConvQNet,
        env: E,
        evaluator: Evaluator,
        device: Device,
    ) -> Result<Self> {
        cfg.validate()?;
        let forecast = model.snapshot_frozen()?;
        let optimizer = match cfg.mode {
            Mode::Build => Some(AdamW::new(
                model.trainable_vars(),
                ParamsAdamW {
                    lr: cfg.learning_rate,
                    ..Default::default()
                },
            )?),
            Mode::Validate => None,
        };
        let rng = match cfg.seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => SmallRng::from_os_rng(),
        };
        let memory = ReplayMemory::new(cfg.memory_capacity, cfg.batch_size);
        Ok(Self {
            cfg,
            model,
            forecast,
            env,
            memory,
            optimizer,
            evaluator,
            rng,
            device,
        })
    }

    pub fn run(&mut self) -> Result<()> {
        let mut current = self.env.reset()?;
        let epsilon = match self.cfg.mode {
            Mode::Build => self.cfg.epsilon,
            Mode::Validate => 0.0,
        };
        info!(
            "starting {:?} run for {} steps (epsilon {epsilon})",
            self.cfg.mode, self.cfg.max_step_count
        );

        while self.evaluator.count() < self.cfg.max_step_count {
            let step = self.evaluator.count();

            let q_row: Vec<f32> = self
                .model
                .forward(&current.unsqueeze(0)?)?
                .flatten_all()?
                .to_vec1()?;
            let action = epsilon_greedy(&q_row, epsilon, &mut self.rng);

            let result = self.env.step(&decode(action))?;
            debug!(
                "step {step}: {} -> reward {}",
                ActionLabel(action),
                result.reward
            );
            if self.cfg.render {
                self.env.render()?;
            }

            let (loss, future_value) = match self.cfg.mode {
                Mode::Build => {
                    let (loss, future) =
                        self.learn(&current, action, result.reward, &result.screen, result.done)?;
                    (Some(loss), Some(future))
                }
                Mode::Validate => (None, None),
            };

            let screen_pixels = || result.screen.flatten_all().and_then(|t| t.to_vec1());
            self.evaluator.record_step(
                StepSummary {
                    step,
                    action,
                    reward: result.reward,
                    loss,
                    future_value,
                },
                || SelectiveSummary {
                    step,
                    q_estimate: q_row.clone(),
                    screen: screen_pixels().ok(),
                },
            )?;

            let completed = step + 1;
            if self.cfg.mode == Mode::Build {
                if completed % self.cfg.forecast_refresh_interval == 0 {
                    debug!("refreshing forecast model at step {completed}");
                    self.forecast = self.model.snapshot_frozen()?;
                }
                if completed % self.cfg.save_interval == 0 {
                    self.save_checkpoint()?;
                }
            }

            current = if result.done {
                self.env.reset()?
            } else {
                result.screen
            };
        }

        if self.cfg.mode == Mode::Build {
            self.save_checkpoint()?;
        }
        self.evaluator.flush()?;
        info!("run finished after {} steps", self.evaluator.count());
        Ok(())
    }

    /// One gradient update over the freshest transition plus a uniform
    /// sample of stored ones. Returns the scalar loss and the forecast
    /// value used for the live entry.
    fn learn(
        &mut self,
        start: &Tensor,
        action: usize,
        reward: f32,
        end: &Tensor,
        done: bool,
    ) -> Result<(f32, f32)> {
        self.memory.add(Transition {
            start: start.clone(),
            action,
            reward,
            end: end.clone(),
        });
        self.memory.sample_new_batch(&mut self.rng);
        let starts = self.memory.batch_starts_including(start)?;
        let outcomes = self.memory.batch_outcomes_including(action, reward, end)?;

        let q_est = self.model.forward(&starts)?;
        let future: Vec<f32> = self
            .forecast
            .forward(&outcomes.ends)?
            .max(D::Minus1)?
            .to_vec1()?;
        let observed = observed_values(&outcomes.rewards, &future, self.cfg.gamma as f32, done);

        let loss = masked_huber_loss(&q_est, &outcomes.actions, &observed, &self.device)?;
        let optimizer = self
            .optimizer
            .as_mut()
            .context("learning without an optimizer")?;
        optimizer.backward_step(&loss)?;

        let live_future = if done { 0.0 } else { future[0] };
        Ok((loss.to_scalar::<f32>()?, live_future))
    }

    fn save_checkpoint(&self) -> Result<()> {
        let screen = self.model.screen();
        checkpoint::save(
            &self.cfg.checkpoint_dir,
            &self.model,
            &CheckpointMeta {
                epsilon: self.cfg.epsilon,
                right_bias: self.cfg.right_bias,
                width: screen.width,
                height: screen.height,
                grayscale: screen.grayscale,
                gamma: self.cfg.gamma,
            },
        )
    }
}
