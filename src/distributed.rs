//! Multi-worker training plumbing.
//!
//! A [`Collective`] is the only thing the trainer knows about other workers: ranks, a world
//! size, and a summing all-reduce. [`ThreadGroup`] implements it for workers living on threads
//! of one process, which is how the equivalence tests run two workers without any real fabric.
//! Loss reduction and gradient averaging are thin layers on top.
use crate::error::Error;
use crate::model::{
    AcousticModel, InferenceInputs, InferenceOutputs, MelSynthesizer, ModelInputs, ModelOutputs,
    ModelState, ModelTargets, TrainableModel,
};
use ndarray::ArrayD;
use std::sync::{Arc, Condvar, Mutex};

pub trait Collective: Send + Sync {
    fn rank(&self) -> usize;
    fn world_size(&self) -> usize;
    /// Element-wise sum across all workers; every worker leaves with the same result.
    fn all_reduce_sum(&self, data: &mut [f32]) -> Result<(), Error>;
}

/// How a scalar loss is aggregated before logging and checkpoint bookkeeping.
pub trait LossReducer {
    fn reduce(&self, value: f32) -> Result<f32, Error>;
}

/// Single-process training: the local value is the global value.
#[derive(Debug, Default)]
pub struct IdentityReducer;

impl LossReducer for IdentityReducer {
    fn reduce(&self, value: f32) -> Result<f32, Error> {
        Ok(value)
    }
}

/// Distributed training: average the value over the world.
pub struct AverageReducer {
    comm: Arc<dyn Collective>,
}

impl AverageReducer {
    pub fn new(comm: Arc<dyn Collective>) -> Self {
        Self { comm }
    }
}

impl LossReducer for AverageReducer {
    fn reduce(&self, value: f32) -> Result<f32, Error> {
        let mut buf = [value];
        self.comm.all_reduce_sum(&mut buf)?;
        Ok(buf[0] / self.comm.world_size() as f32)
    }
}

struct GroupShared {
    state: Mutex<GroupState>,
    cond: Condvar,
}

struct GroupState {
    buffer: Vec<f32>,
    arrived: usize,
    departed: usize,
    generation: u64,
    draining: bool,
}

/// An in-process collective over `world_size` threads. Each participant holds one handle and
/// calls [`Collective::all_reduce_sum`] in lockstep; the last arrival publishes the sum and the
/// barrier resets once everyone has read it.
pub struct ThreadGroup {
    rank: usize,
    world_size: usize,
    shared: Arc<GroupShared>,
}

impl ThreadGroup {
    /// Handles for every rank of a fresh group.
    pub fn new(world_size: usize) -> Vec<ThreadGroup> {
        let shared = Arc::new(GroupShared {
            state: Mutex::new(GroupState {
                buffer: Vec::new(),
                arrived: 0,
                departed: 0,
                generation: 0,
                draining: false,
            }),
            cond: Condvar::new(),
        });
        (0..world_size)
            .map(|rank| ThreadGroup {
                rank,
                world_size,
                shared: Arc::clone(&shared),
            })
            .collect()
    }
}

impl Collective for ThreadGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn all_reduce_sum(&self, data: &mut [f32]) -> Result<(), Error> {
        let mut state = self
            .shared
            .state
            .lock()
            .map_err(|_| Error::Collective("collective lock poisoned".into()))?;

        // Wait out the tail of the previous reduction.
        while state.draining {
            state = self
                .shared
                .cond
                .wait(state)
                .map_err(|_| Error::Collective("collective lock poisoned".into()))?;
        }

        if state.arrived == 0 {
            state.buffer = vec![0.0; data.len()];
        } else if state.buffer.len() != data.len() {
            return Err(Error::Collective(format!(
                "rank {} reduced {} elements where others reduced {}",
                self.rank,
                data.len(),
                state.buffer.len()
            )));
        }
        for (acc, &x) in state.buffer.iter_mut().zip(data.iter()) {
            *acc += x;
        }
        state.arrived += 1;

        if state.arrived == self.world_size {
            state.draining = true;
            state.generation += 1;
            self.shared.cond.notify_all();
        } else {
            let generation = state.generation;
            while state.generation == generation {
                state = self
                    .shared
                    .cond
                    .wait(state)
                    .map_err(|_| Error::Collective("collective lock poisoned".into()))?;
            }
        }

        data.copy_from_slice(&state.buffer);
        state.departed += 1;
        if state.departed == self.world_size {
            state.arrived = 0;
            state.departed = 0;
            state.draining = false;
            self.shared.cond.notify_all();
        }
        Ok(())
    }
}

/// Wraps a model so that after every backward pass the gradients are averaged across the
/// collective, mirroring distributed data parallelism.
pub struct GradSync<M> {
    inner: M,
    comm: Arc<dyn Collective>,
}

impl<M: TrainableModel> GradSync<M> {
    pub fn new(inner: M, comm: Arc<dyn Collective>) -> Self {
        Self { inner, comm }
    }

    pub fn into_inner(self) -> M {
        self.inner
    }

    fn sync_gradients(&mut self) -> Result<(), Error> {
        let world = self.comm.world_size() as f32;
        let mut failure = None;
        let comm = Arc::clone(&self.comm);
        self.inner.visit_gradients(&mut |_, grad| {
            if failure.is_some() {
                return;
            }
            if let Some(slice) = grad.as_slice_memory_order_mut() {
                if let Err(e) = comm.all_reduce_sum(slice) {
                    failure = Some(e);
                    return;
                }
                for g in slice.iter_mut() {
                    *g /= world;
                }
            } else {
                failure = Some(Error::Collective(
                    "gradient tensor is not contiguous".into(),
                ));
            }
        });
        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl<M: TrainableModel> MelSynthesizer for GradSync<M> {
    fn inference(&self, input: &InferenceInputs) -> anyhow::Result<InferenceOutputs> {
        self.inner.inference(input)
    }
}

impl<M: TrainableModel> AcousticModel for GradSync<M> {
    fn forward(&mut self, x: &ModelInputs) -> anyhow::Result<ModelOutputs> {
        self.inner.forward(x)
    }

    fn set_current_frames_per_step(&mut self, n: usize) {
        self.inner.set_current_frames_per_step(n);
    }

    fn set_train(&mut self, training: bool) {
        self.inner.set_train(training);
    }
}

impl<M: TrainableModel> TrainableModel for GradSync<M> {
    fn zero_grad(&mut self) {
        self.inner.zero_grad();
    }

    fn backward(
        &mut self,
        x: &ModelInputs,
        y_pred: &ModelOutputs,
        y: &ModelTargets,
        loss_scale: f32,
    ) -> anyhow::Result<()> {
        self.inner.backward(x, y_pred, y, loss_scale)?;
        self.sync_gradients()?;
        Ok(())
    }

    fn visit_gradients(&mut self, f: &mut dyn FnMut(&str, &mut ArrayD<f32>)) {
        self.inner.visit_gradients(f);
    }

    fn visit_parameters(&mut self, f: &mut dyn FnMut(&str, &mut ArrayD<f32>, &ArrayD<f32>)) {
        self.inner.visit_parameters(f);
    }

    fn state_dict(&self) -> ModelState {
        self.inner.state_dict()
    }

    fn load_state_dict(&mut self, state: &ModelState) -> anyhow::Result<()> {
        self.inner.load_state_dict(state)
    }
}
