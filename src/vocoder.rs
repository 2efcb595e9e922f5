//! HiFi-GAN vocoder over ONNX. One graph, one input (`[1, n_mel_channels, frames]` log mels),
//! one output (the waveform), so the bridge is small.
use crate::model::Vocoder;
use anyhow::Context;
use ndarray::{ArrayView2, Axis};
use ort::{inputs, CPUExecutionProvider, GraphOptimizationLevel, Session};
use std::path::Path;

pub struct HiFiGan {
    session: Session,
}

impl HiFiGan {
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        ort::init()
            .with_name("polyvox")
            .with_execution_providers(&[CPUExecutionProvider::default().build()])
            .commit()?;

        let session = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level1)?
            .with_model_from_file(path.as_ref())
            .context("converting hifigan to runnable model")?;

        Ok(Self { session })
    }
}

impl Vocoder for HiFiGan {
    fn infer(&self, mel: ArrayView2<f32>) -> anyhow::Result<Vec<f32>> {
        let batched = mel.insert_axis(Axis(0));
        let outputs = self.session.run(inputs![batched]?)?;
        let audio = outputs[0].extract_tensor::<f32>()?;
        // Whatever the output shape, it flattens to mono samples.
        Ok(audio.view().iter().copied().collect())
    }
}
