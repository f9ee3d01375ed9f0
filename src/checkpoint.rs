use std::path::Path;

use anyhow::{bail, Context, Result};
use candle_core::Device;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::model::{ConvQNet, QModel};
use crate::ScreenConfig;

const WEIGHTS_FILE: &str = "model.safetensors";
const META_FILE: &str = "meta.json";

/// Run parameters stored alongside the weights, so a resumed run can
/// refuse input that no longer matches the network topology.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointMeta {
    pub epsilon: f64,
    pub right_bias: f64,
    pub width: usize,
    pub height: usize,
    pub grayscale: bool,
    pub gamma: f64,
}

pub fn save(dir: &Path, model: &ConvQNet, meta: &CheckpointMeta) -> Result<()> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("creating checkpoint directory {}", dir.display()))?;
    model.save_weights(&dir.join(WEIGHTS_FILE))?;
    let meta_json = serde_json::to_vec_pretty(meta)?;
    std::fs::write(dir.join(META_FILE), meta_json)
        .with_context(|| format!("writing checkpoint metadata in {}", dir.display()))?;
    info!("saved checkpoint to {}", dir.display());
    Ok(())
}

pub fn load(dir: &Path, screen: &ScreenConfig, device: &Device) -> Result<(ConvQNet, CheckpointMeta)> {
    let meta_path = dir.join(META_FILE);
    let meta_json = std::fs::read(&meta_path)
        .with_context(|| format!("reading checkpoint metadata {}", meta_path.display()))?;
    let meta: CheckpointMeta = serde_json::from_slice(&meta_json)
        .with_context(|| format!("parsing checkpoint metadata {}", meta_path.display()))?;
    if meta.width != screen.width || meta.height != screen.height || meta.grayscale != screen.grayscale
    {
        bail!(
            "checkpoint was trained at {}x{} (grayscale: {}) but the run asks for {}x{} (grayscale: {})",
            meta.width,
            meta.height,
            meta.grayscale,
            screen.width,
            screen.height,
            screen.grayscale
        );
    }
    let mut model = ConvQNet::new(screen, device)?;
    model.load_weights(&dir.join(WEIGHTS_FILE))?;
    info!("loaded checkpoint from {}", dir.display());
    Ok((model, meta))
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Tensor};

    fn screen_32() -> ScreenConfig {
        ScreenConfig {
            width: 32,
            height: 32,
            grayscale: true,
        }
    }

    fn meta(screen: &ScreenConfig) -> CheckpointMeta {
        CheckpointMeta {
            epsilon: 0.1,
            right_bias: 0.25,
            width: screen.width,
            height: screen.height,
            grayscale: screen.grayscale,
            gamma: 0.99,
        }
    }

    #[test]
    fn checkpoint_round_trip_restores_weights_and_meta() {
        let dir = tempfile::tempdir().unwrap();
        let screen = screen_32();
        let model = ConvQNet::new(&screen, &Device::Cpu).unwrap();
        model.apply_right_bias(2.0).unwrap();
        save(dir.path(), &model, &meta(&screen)).unwrap();

        let (restored, restored_meta) = load(dir.path(), &screen, &Device::Cpu).unwrap();
        assert_eq!(restored_meta.right_bias, 0.25);
        assert_eq!(restored_meta.gamma, 0.99);

        let input = Tensor::zeros((1, 1, 32, 32), DType::F32, &Device::Cpu).unwrap();
        let a: Vec<f32> = model
            .forward(&input)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        let b: Vec<f32> = restored
            .forward(&input)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn resolution_mismatch_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let screen = screen_32();
        let model = ConvQNet::new(&screen, &Device::Cpu).unwrap();
        save(dir.path(), &model, &meta(&screen)).unwrap();

        let other = ScreenConfig {
            width: 64,
            height: 64,
            grayscale: true,
        };
        let err = load(dir.path(), &other, &Device::Cpu).unwrap_err();
        assert!(err.to_string().contains("trained at 32x32"));
    }

    #[test]
    fn missing_checkpoint_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load(&dir.path().join("absent"), &screen_32(), &Device::Cpu).is_err());
    }
}
