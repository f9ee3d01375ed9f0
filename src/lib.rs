use anyhow::{bail, Result};

/// Native Genesis frame geometry, as delivered by the simulator.
pub const NATIVE_WIDTH: usize = 320;
pub const NATIVE_HEIGHT: usize = 224;
pub const NATIVE_CHANNELS: usize = 3;

/// Downsampling factor of the convolution stack (two pool-4 stages and
/// one pool-2 stage). Screen resolutions must divide evenly by this.
pub const POOL_FACTOR: usize = 32;

pub mod action;
pub mod checkpoint;
pub mod env;
pub mod metrics;
pub mod model;
pub mod replay;
pub mod store;
pub mod trainer;

pub use action::{decode, encode, ControlVector, ACTION_COUNT, BUTTON_COUNT};
pub use env::{Environment, RemoteEnv, SimCorridorEnv, StepResult};
pub use metrics::{Evaluator, NotablePolicy, SelectiveSummary, StepSummary, WindowError};
pub use model::{ConvQNet, QModel};
pub use replay::{OutcomeBatch, ReplayMemory, Transition};
pub use store::{BlobStore, DirStore};
pub use trainer::{Mode, Trainer, TrainerConfig};

/// Shape of a preprocessed observation: the height and width of the
/// frames the model consumes, and whether they are collapsed to a
/// single luma channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScreenConfig {
    pub width: usize,
    pub height: usize,
    pub grayscale: bool,
}

impl Default for ScreenConfig {
    fn default() -> Self {
        Self {
            width: NATIVE_WIDTH,
            height: NATIVE_HEIGHT,
            grayscale: false,
        }
    }
}

impl ScreenConfig {
    pub fn channels(&self) -> usize {
        if self.grayscale {
            1
        } else {
            NATIVE_CHANNELS
        }
    }

    /// Rejects resolutions the convolution stack cannot consume.
    /// This is a startup error, not something to recover from mid-run.
    pub fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            bail!(
                "screen resolution must be nonzero, got {}x{}",
                self.width,
                self.height
            );
        }
        if self.width % POOL_FACTOR != 0 || self.height % POOL_FACTOR != 0 {
            bail!(
                "unsupported screen resolution {}x{}: both sides must be divisible by {}",
                self.width,
                self.height,
                POOL_FACTOR
            );
        }
        Ok(())
    }
}
