use std::path::Path;

use anyhow::{anyhow, Context, Result};
use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{conv2d, linear, Conv2d, Conv2dConfig, Linear, Module, VarBuilder, VarMap};

use crate::{action, ScreenConfig, ACTION_COUNT};

/// Capability every differentiable value model must provide.
///
/// The trainer never inspects the architecture behind this seam: it
/// forwards observation batches, snapshots a frozen copy for stable
/// learning targets, and hands the trainable parameters to an optimizer.
pub trait QModel: Sized {
    /// Batched value estimates: `[n, channels, height, width]` screens in,
    /// `[n, ACTION_COUNT]` Q-values out.
    fn forward(&self, screens: &Tensor) -> candle_core::Result<Tensor>;

    /// A structurally identical copy with the current parameter values,
    /// detached from the gradient graph. The copy never receives
    /// gradients; the caller replaces it wholesale on its refresh cadence.
    fn snapshot_frozen(&self) -> Result<Self>;

    fn trainable_vars(&self) -> Vec<Var>;

    fn save_weights(&self, path: &Path) -> Result<()>;

    fn load_weights(&mut self, path: &Path) -> Result<()>;
}

/// Convolution Q-network over preprocessed screen tensors.
///
/// Topology: 7x7 conv to 10 maps, pool 4; 3x3 conv to 32 maps, pool 4;
/// 3x3 conv to 64 maps, pool 2; linear head to one value per action.
pub struct ConvQNet {
    varmap: VarMap,
    conv1: Conv2d,
    conv2: Conv2d,
    conv3: Conv2d,
    fc: Linear,
    screen: ScreenConfig,
    device: Device,
}

impl std::fmt::Debug for ConvQNet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConvQNet")
            .field("conv1", &self.conv1)
            .field("conv2", &self.conv2)
            .field("conv3", &self.conv3)
            .field("fc", &self.fc)
            .field("screen", &self.screen)
            .field("device", &self.device)
            .finish_non_exhaustive()
    }
}

impl ConvQNet {
    pub fn new(screen: &ScreenConfig, device: &Device) -> Result<Self> {
        screen.validate()?;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let pad3 = Conv2dConfig {
            padding: 3,
            ..Default::default()
        };
        let pad1 = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        let conv1 = conv2d(screen.channels(), 10, 7, pad3, vb.pp("conv1"))?;
        let conv2 = conv2d(10, 32, 3, pad1, vb.pp("conv2"))?;
        let conv3 = conv2d(32, 64, 3, pad1, vb.pp("conv3"))?;
        let fc_in = 64 * (screen.height / crate::POOL_FACTOR) * (screen.width / crate::POOL_FACTOR);
        let fc = linear(fc_in, ACTION_COUNT, vb.pp("fc"))?;
        Ok(Self {
            varmap,
            conv1,
            conv2,
            conv3,
            fc,
            screen: screen.clone(),
            device: device.clone(),
        })
    }

    pub fn screen(&self) -> &ScreenConfig {
        &self.screen
    }

    /// Nudges the initial head bias of every RIGHT-asserting action, so a
    /// fresh agent starts out running toward the goal instead of dithering.
    pub fn apply_right_bias(&self, amount: f64) -> Result<()> {
        if amount == 0.0 {
            return Ok(());
        }
        let delta: Vec<f32> = (0..ACTION_COUNT)
            .map(|i| if action::presses_right(i) { amount as f32 } else { 0.0 })
            .collect();
        let delta = Tensor::from_vec(delta, ACTION_COUNT, &self.device)?;
        let data = self
            .varmap
            .data()
            .lock()
            .map_err(|_| anyhow!("varmap lock poisoned"))?;
        let bias = data
            .get("fc.bias")
            .context("missing fc.bias in varmap")?;
        bias.set(&bias.as_tensor().add(&delta)?)?;
        Ok(())
    }

    fn copy_params_from(&self, source: &VarMap) -> Result<()> {
        let source_data = source
            .data()
            .lock()
            .map_err(|_| anyhow!("varmap lock poisoned"))?;
        let mut target_data = self
            .varmap
            .data()
            .lock()
            .map_err(|_| anyhow!("varmap lock poisoned"))?;
        for (name, target_var) in target_data.iter_mut() {
            let source_var = source_data
                .get(name)
                .with_context(|| format!("missing var {name} in source varmap"))?;
            target_var.set(&source_var.as_tensor().detach())?;
        }
        Ok(())
    }
}

impl QModel for ConvQNet {
    fn forward(&self, screens: &Tensor) -> candle_core::Result<Tensor> {
        let h = self.conv1.forward(screens)?.relu()?.max_pool2d(4)?;
        let h = self.conv2.forward(&h)?.relu()?.max_pool2d(4)?;
        let h = self.conv3.forward(&h)?.relu()?.max_pool2d(2)?;
        self.fc.forward(&h.flatten_from(1)?)
    }

    fn snapshot_frozen(&self) -> Result<Self> {
        let snapshot = Self::new(&self.screen, &self.device)?;
        snapshot.copy_params_from(&self.varmap)?;
        Ok(snapshot)
    }

    fn trainable_vars(&self) -> Vec<Var> {
        self.varmap.all_vars()
    }

    fn save_weights(&self, path: &Path) -> Result<()> {
        self.varmap
            .save(path)
            .with_context(|| format!("saving model weights to {}", path.display()))
    }

    fn load_weights(&mut self, path: &Path) -> Result<()> {
        self.varmap
            .load(path)
            .with_context(|| format!("loading model weights from {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_screen() -> ScreenConfig {
        ScreenConfig {
            width: 32,
            height: 32,
            grayscale: true,
        }
    }

    fn zeros_batch(n: usize, screen: &ScreenConfig) -> Tensor {
        Tensor::zeros(
            (n, screen.channels(), screen.height, screen.width),
            DType::F32,
            &Device::Cpu,
        )
        .unwrap()
    }

    #[test]
    fn forward_produces_one_value_per_action() {
        let screen = small_screen();
        let net = ConvQNet::new(&screen, &Device::Cpu).unwrap();
        let q = net.forward(&zeros_batch(3, &screen)).unwrap();
        assert_eq!(q.dims(), &[3, ACTION_COUNT]);
    }

    #[test]
    fn unsupported_resolution_is_a_startup_error() {
        let screen = ScreenConfig {
            width: 50,
            height: 50,
            grayscale: true,
        };
        assert!(ConvQNet::new(&screen, &Device::Cpu).is_err());
    }

    #[test]
    fn snapshot_matches_source_parameters() {
        let screen = small_screen();
        let net = ConvQNet::new(&screen, &Device::Cpu).unwrap();
        let snapshot = net.snapshot_frozen().unwrap();
        let input = zeros_batch(1, &screen);
        let q_net: Vec<f32> = net.forward(&input).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        let q_snap: Vec<f32> = snapshot
            .forward(&input)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        assert_eq!(q_net, q_snap);
    }

    #[test]
    fn snapshot_is_decoupled_from_later_updates() {
        let screen = small_screen();
        let net = ConvQNet::new(&screen, &Device::Cpu).unwrap();
        let snapshot = net.snapshot_frozen().unwrap();
        let input = zeros_batch(1, &screen);
        let before: Vec<f32> = snapshot
            .forward(&input)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();

        net.apply_right_bias(5.0).unwrap();

        let after: Vec<f32> = snapshot
            .forward(&input)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        assert_eq!(before, after);
        // and the live net did move
        let live: Vec<f32> = net.forward(&input).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        assert_ne!(live, after);
    }

    #[test]
    fn right_bias_lifts_only_right_running_actions() {
        let screen = small_screen();
        let net = ConvQNet::new(&screen, &Device::Cpu).unwrap();
        let input = zeros_batch(1, &screen);
        let before: Vec<f32> = net.forward(&input).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        net.apply_right_bias(1.0).unwrap();
        let after: Vec<f32> = net.forward(&input).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        for i in 0..ACTION_COUNT {
            let delta = after[i] - before[i];
            if action::presses_right(i) {
                assert!((delta - 1.0).abs() < 1e-5, "action {i}: delta {delta}");
            } else {
                assert!(delta.abs() < 1e-5, "action {i}: delta {delta}");
            }
        }
    }

    #[test]
    fn weights_round_trip_through_safetensors() {
        let screen = small_screen();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.safetensors");
        let net = ConvQNet::new(&screen, &Device::Cpu).unwrap();
        net.save_weights(&path).unwrap();

        let mut other = ConvQNet::new(&screen, &Device::Cpu).unwrap();
        other.load_weights(&path).unwrap();

        let input = zeros_batch(1, &screen);
        let a: Vec<f32> = net.forward(&input).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        let b: Vec<f32> = other.forward(&input).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(a, b);
    }
}
