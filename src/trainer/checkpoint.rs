//! Checkpoint serialisation. Everything beyond the weights is optional on load so checkpoints
//! from other trainers (weights-only exports, older layouts that called the weights
//! `state_dict`) can still be warm started from.
use crate::model::ModelState;
use crate::optim::AdamState;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Checkpoint {
    #[serde(alias = "state_dict")]
    pub model: ModelState,
    #[serde(default)]
    pub optimizer: Option<AdamState>,
    #[serde(default)]
    pub iteration: Option<usize>,
    #[serde(default)]
    pub learning_rate: Option<f32>,
    #[serde(default)]
    pub global_step: Option<u64>,
}

impl Checkpoint {
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let data = fs::read_to_string(path)
            .with_context(|| format!("reading checkpoint {}", path.display()))?;
        let checkpoint = serde_json::from_str(&data)
            .with_context(|| format!("parsing checkpoint {}", path.display()))?;
        Ok(checkpoint)
    }

    /// Write atomically: serialise to a sibling temp file, then rename into place so a crash
    /// mid-write never clobbers the previous checkpoint.
    pub fn save(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("tmp");
        let data = serde_json::to_string(self)?;
        fs::write(&tmp, data)
            .with_context(|| format!("writing checkpoint {}", tmp.display()))?;
        fs::rename(&tmp, path)
            .with_context(|| format!("replacing checkpoint {}", path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::ArrayD;
    use std::collections::BTreeMap;

    fn weights() -> ModelState {
        let mut map = BTreeMap::new();
        map.insert(
            "encoder.weight".to_string(),
            ArrayD::from_shape_vec(vec![2, 2], vec![1.0, 2.0, 3.0, 4.0]).unwrap(),
        );
        ModelState(map)
    }

    #[test]
    fn round_trip_preserves_everything() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mellotron_3");
        let checkpoint = Checkpoint {
            model: weights(),
            optimizer: Some(AdamState::default()),
            iteration: Some(3),
            learning_rate: Some(1e-3),
            global_step: Some(4200),
        };
        checkpoint.save(&path).unwrap();
        assert!(!path.with_extension("tmp").exists());

        let back = Checkpoint::load(&path).unwrap();
        assert_eq!(back.model, checkpoint.model);
        assert_eq!(back.iteration, Some(3));
        assert_eq!(back.learning_rate, Some(1e-3));
        assert_eq!(back.global_step, Some(4200));
        assert!(back.optimizer.is_some());
    }

    #[test]
    fn weights_only_checkpoint_loads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("weights_only");
        let json = serde_json::json!({
            "state_dict": serde_json::to_value(weights()).unwrap(),
        });
        fs::write(&path, json.to_string()).unwrap();

        let back = Checkpoint::load(&path).unwrap();
        assert_eq!(back.model, weights());
        assert!(back.optimizer.is_none());
        assert!(back.iteration.is_none());
        assert!(back.global_step.is_none());
    }

    #[test]
    fn save_overwrites_previous() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ckpt");
        let mut checkpoint = Checkpoint {
            model: weights(),
            global_step: Some(1),
            ..Default::default()
        };
        checkpoint.save(&path).unwrap();
        checkpoint.global_step = Some(2);
        checkpoint.save(&path).unwrap();
        assert_eq!(Checkpoint::load(&path).unwrap().global_step, Some(2));
    }
}
