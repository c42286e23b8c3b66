use candle_core::{DType, Device, Module, Tensor, D};
use candle_nn::{self as nn, VarBuilder, VarMap};
use tracing::{debug, info};

use super::memo::{HashedTensor, MemoEntry, MemoStore};
use crate::config::DynamicsConfig;
use crate::device::select_device;
use crate::error::{DynamicsError, DynamicsResult};

/// Width of the first hidden projection.
pub const HIDDEN_DIM: usize = 256;
/// Width of the shared representation read by the output heads.
pub const HEAD_DIM: usize = 32;

/// Bounds that keep termination strictly inside (0, 1) once the f32 sigmoid saturates.
const TERM_MIN: f32 = f32::MIN_POSITIVE;
const TERM_MAX: f32 = 1.0 - f32::EPSILON / 2.0;

/// Output of one dynamics query.
#[derive(Debug, Clone)]
pub struct Prediction {
    /// Predicted latent observation after the action.
    pub latent_next_obs: Tensor,
    /// Predicted reward, unbounded.
    pub reward: Tensor,
    /// Predicted termination probability in (0, 1).
    pub term: Tensor,
    /// True when the triple came from the memo store instead of the network.
    pub memo_hit: bool,
}

impl Prediction {
    fn from_memo(entry: &MemoEntry) -> Self {
        Self {
            latent_next_obs: entry.latent_next_obs.clone(),
            reward: entry.reward.clone(),
            term: entry.term.clone(),
            memo_hit: true,
        }
    }

    pub fn into_parts(self) -> (Tensor, Tensor, Tensor, bool) {
        (self.latent_next_obs, self.reward, self.term, self.memo_hit)
    }
}

/// Predicts the next latent, the reward and the termination probability from a
/// latent observation and a one-hot action.
///
/// While memoization is on, unbatched queries are cached by exact input value so
/// that a planner revisiting the same (state, action) pair skips the network.
pub struct LatentDynamicsModel {
    fc1: nn::Linear,
    fc2: nn::Linear,
    latent_out: nn::Linear,
    reward_out: nn::Linear,
    term_out: nn::Linear,
    latent_state_dim: usize,
    action_dim: usize,
    delta_mode: bool,
    device: Device,
    memoize_on: bool,
    memos: MemoStore,
}

impl LatentDynamicsModel {
    /// Build the network from `vb`; parameters live on `vb.device()`.
    pub fn new(
        vb: VarBuilder<'_>,
        latent_state_dim: usize,
        action_dim: usize,
        delta_mode: bool,
    ) -> DynamicsResult<Self> {
        DynamicsConfig::new(latent_state_dim, action_dim).validate()?;
        let fc1 = nn::linear(latent_state_dim + action_dim, HIDDEN_DIM, vb.pp("fc1"))?;
        let fc2 = nn::linear(HIDDEN_DIM, HEAD_DIM, vb.pp("fc2"))?;
        let latent_out = nn::linear(HEAD_DIM, latent_state_dim, vb.pp("latent_out"))?;
        let reward_out = nn::linear(HEAD_DIM, 1, vb.pp("reward_out"))?;
        let term_out = nn::linear(HEAD_DIM, 1, vb.pp("term_out"))?;
        let device = vb.device().clone();
        info!(
            latent_state_dim,
            action_dim,
            delta_mode,
            device = ?device,
            "built latent dynamics model"
        );
        Ok(Self {
            fc1,
            fc2,
            latent_out,
            reward_out,
            term_out,
            latent_state_dim,
            action_dim,
            delta_mode,
            device,
            memoize_on: false,
            memos: MemoStore::new(),
        })
    }

    /// Select the device named by `config` and register fresh F32 parameters in `varmap`.
    ///
    /// The caller keeps `varmap` for optimizers and for `save`/`load` of the weights.
    pub fn from_config(config: &DynamicsConfig, varmap: &VarMap) -> DynamicsResult<Self> {
        config.validate()?;
        let device = select_device(config.device.as_deref())?;
        let vb = VarBuilder::from_varmap(varmap, DType::F32, &device);
        Self::new(
            vb,
            config.latent_state_dim,
            config.action_dim,
            config.delta_mode,
        )
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn latent_state_dim(&self) -> usize {
        self.latent_state_dim
    }

    pub fn action_dim(&self) -> usize {
        self.action_dim
    }

    pub fn delta_mode(&self) -> bool {
        self.delta_mode
    }

    pub fn start_memoize(&mut self) {
        self.memoize_on = true;
    }

    /// Stop consulting and populating the store. Existing entries are kept.
    pub fn stop_memoize(&mut self) {
        self.memoize_on = false;
    }

    pub fn is_memoizing(&self) -> bool {
        self.memoize_on
    }

    /// Store a prediction for (`latent_obs`, `action`) whether or not memoization is on.
    pub fn set_memo(
        &mut self,
        latent_obs: &Tensor,
        action: &Tensor,
        latent_next_obs: &Tensor,
        reward: &Tensor,
        term: &Tensor,
    ) -> DynamicsResult<()> {
        self.check_inputs(latent_obs, action)?;
        let (_, x) = self.marshal(latent_obs, action)?;
        let key = memo_key(&x)?;
        self.memos.insert(
            key,
            MemoEntry {
                latent_next_obs: latent_next_obs.clone(),
                reward: reward.clone(),
                term: term.clone(),
            },
        );
        Ok(())
    }

    pub fn clear_memos(&mut self) {
        self.memos.clear();
    }

    pub fn memo_len(&self) -> usize {
        self.memos.len()
    }

    /// Predict (next latent, reward, termination probability) for one query.
    ///
    /// Inputs may be rank 1 (`[dim]`) or batched (`[.., dim]`) with matching
    /// leading axes; outputs keep the input rank. While memoizing only a single
    /// row is accepted.
    pub fn predict(&mut self, latent_obs: &Tensor, action: &Tensor) -> DynamicsResult<Prediction> {
        self.check_inputs(latent_obs, action)?;
        let (latent_obs, x) = self.marshal(latent_obs, action)?;

        let key = if self.memoize_on {
            let key = memo_key(&x)?;
            if let Some(entry) = self.memos.get(&key) {
                debug!(memos = self.memos.len(), "memo hit");
                return Ok(Prediction::from_memo(entry));
            }
            Some(key)
        } else {
            None
        };

        let prediction = self.forward(&latent_obs, &x)?;

        if let Some(key) = key {
            self.memos.insert(
                key,
                MemoEntry {
                    latent_next_obs: prediction.latent_next_obs.clone(),
                    reward: prediction.reward.clone(),
                    term: prediction.term.clone(),
                },
            );
            debug!(memos = self.memos.len(), "memo miss, stored");
        }
        Ok(prediction)
    }

    /// Alias of [`Self::predict`].
    pub fn run(&mut self, latent_obs: &Tensor, action: &Tensor) -> DynamicsResult<Prediction> {
        self.predict(latent_obs, action)
    }

    fn check_inputs(&self, latent_obs: &Tensor, action: &Tensor) -> DynamicsResult<()> {
        let latent_dims = latent_obs.dims();
        let action_dims = action.dims();
        let (latent_width, latent_lead) = match latent_dims.split_last() {
            Some((w, lead)) => (*w, lead),
            None => (0, &[][..]),
        };
        let (action_width, action_lead) = match action_dims.split_last() {
            Some((w, lead)) => (*w, lead),
            None => (0, &[][..]),
        };
        if latent_width != self.latent_state_dim {
            return Err(DynamicsError::shape_mismatch(
                format!("latent_obs [.., {}]", self.latent_state_dim),
                format!("{latent_dims:?}"),
            ));
        }
        if action_width != self.action_dim {
            return Err(DynamicsError::shape_mismatch(
                format!("action [.., {}]", self.action_dim),
                format!("{action_dims:?}"),
            ));
        }
        if latent_lead != action_lead {
            return Err(DynamicsError::shape_mismatch(
                format!("action leading axes {latent_lead:?}"),
                format!("{action_lead:?}"),
            ));
        }
        Ok(())
    }

    /// Copy both inputs onto the resident device and concatenate them along the feature axis.
    fn marshal(&self, latent_obs: &Tensor, action: &Tensor) -> DynamicsResult<(Tensor, Tensor)> {
        let latent_obs = latent_obs.to_device(&self.device)?;
        let action = action.to_device(&self.device)?;
        let x = Tensor::cat(&[&latent_obs, &action], D::Minus1)?;
        Ok((latent_obs, x))
    }

    fn forward(&self, latent_obs: &Tensor, x: &Tensor) -> DynamicsResult<Prediction> {
        // Linear layers need a batch axis.
        let unbatched = x.rank() == 1;
        let x = if unbatched { x.unsqueeze(0)? } else { x.clone() };

        let h = self.fc1.forward(&x)?.relu()?;
        let h = self.fc2.forward(&h)?.relu()?;

        let mut state = self.latent_out.forward(&h)?;
        let mut reward = self.reward_out.forward(&h)?;
        let mut logit = self.term_out.forward(&h)?;
        if unbatched {
            state = state.squeeze(0)?;
            reward = reward.squeeze(0)?;
            logit = logit.squeeze(0)?;
        }

        let latent_next_obs = if self.delta_mode {
            latent_obs.broadcast_add(&state)?
        } else {
            state
        };
        let term = nn::ops::sigmoid(&logit)?.clamp(TERM_MIN, TERM_MAX)?;

        Ok(Prediction {
            latent_next_obs,
            reward,
            term,
            memo_hit: false,
        })
    }
}

/// Memo key for a concatenated input. Batches cannot be memoized.
fn memo_key(x: &Tensor) -> DynamicsResult<HashedTensor> {
    let key = HashedTensor::new(x)?;
    if key.is_batched() {
        return Err(DynamicsError::BatchedMemoQuery { rows: key.rows() });
    }
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const LATENT: usize = 4;
    const ACTIONS: usize = 3;

    /// Weights where every hidden unit is zero, so each head outputs its bias.
    fn bias_only_model(delta_mode: bool, state_bias: &[f32], reward_bias: f32) -> LatentDynamicsModel {
        bias_only_model_with_term(delta_mode, state_bias, reward_bias, 0.0)
    }

    fn bias_only_model_with_term(
        delta_mode: bool,
        state_bias: &[f32],
        reward_bias: f32,
        term_bias: f32,
    ) -> LatentDynamicsModel {
        let device = Device::Cpu;
        let mut ts = HashMap::new();
        let layers = [
            ("fc1", LATENT + ACTIONS, HIDDEN_DIM),
            ("fc2", HIDDEN_DIM, HEAD_DIM),
            ("latent_out", HEAD_DIM, LATENT),
            ("reward_out", HEAD_DIM, 1),
            ("term_out", HEAD_DIM, 1),
        ];
        for (name, in_dim, out_dim) in layers {
            ts.insert(
                format!("{name}.weight"),
                Tensor::zeros((out_dim, in_dim), DType::F32, &device).unwrap(),
            );
            ts.insert(
                format!("{name}.bias"),
                Tensor::zeros(out_dim, DType::F32, &device).unwrap(),
            );
        }
        ts.insert(
            "latent_out.bias".to_string(),
            Tensor::new(state_bias, &device).unwrap(),
        );
        ts.insert(
            "reward_out.bias".to_string(),
            Tensor::new(&[reward_bias], &device).unwrap(),
        );
        ts.insert(
            "term_out.bias".to_string(),
            Tensor::new(&[term_bias], &device).unwrap(),
        );
        let vb = VarBuilder::from_tensors(ts, DType::F32, &device);
        LatentDynamicsModel::new(vb, LATENT, ACTIONS, delta_mode).unwrap()
    }

    fn random_model(delta_mode: bool) -> LatentDynamicsModel {
        let varmap = VarMap::new();
        let config = DynamicsConfig::new(LATENT, ACTIONS)
            .with_delta_mode(delta_mode)
            .with_device("cpu");
        LatentDynamicsModel::from_config(&config, &varmap).unwrap()
    }

    fn state(values: [f32; LATENT]) -> Tensor {
        Tensor::new(&values, &Device::Cpu).unwrap()
    }

    fn one_hot(index: usize) -> Tensor {
        let mut v = vec![0f32; ACTIONS];
        v[index] = 1.0;
        Tensor::new(v.as_slice(), &Device::Cpu).unwrap()
    }

    #[test]
    fn test_output_shapes_unbatched() {
        let mut model = random_model(false);
        let out = model.predict(&state([0.1, 0.2, 0.3, 0.4]), &one_hot(1)).unwrap();
        assert_eq!(out.latent_next_obs.dims(), &[LATENT]);
        assert_eq!(out.reward.dims(), &[1]);
        assert_eq!(out.term.dims(), &[1]);
        assert!(!out.memo_hit);
    }

    #[test]
    fn test_output_shapes_batched() {
        let mut model = random_model(false);
        let device = Device::Cpu;
        let s = Tensor::randn(0f32, 1f32, (5, LATENT), &device).unwrap();
        let a = Tensor::zeros((5, ACTIONS), DType::F32, &device).unwrap();
        let out = model.predict(&s, &a).unwrap();
        assert_eq!(out.latent_next_obs.dims(), &[5, LATENT]);
        assert_eq!(out.reward.dims(), &[5, 1]);
        assert_eq!(out.term.dims(), &[5, 1]);
    }

    #[test]
    fn test_absolute_mode_uses_head_output() {
        let mut model = bias_only_model(false, &[1.0, -2.0, 0.5, 3.0], 1.5);
        let out = model.predict(&state([10.0, 10.0, 10.0, 10.0]), &one_hot(0)).unwrap();
        let next: Vec<f32> = out.latent_next_obs.to_vec1().unwrap();
        assert_eq!(next, vec![1.0, -2.0, 0.5, 3.0]);
        let reward: Vec<f32> = out.reward.to_vec1().unwrap();
        assert_eq!(reward, vec![1.5]);
        let term: Vec<f32> = out.term.to_vec1().unwrap();
        assert!((term[0] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_delta_mode_adds_input_latent() {
        let mut model = bias_only_model(true, &[1.0, -2.0, 0.5, 3.0], 0.0);
        assert!(model.delta_mode());
        let out = model.predict(&state([10.0, 20.0, 30.0, 40.0]), &one_hot(2)).unwrap();
        let next: Vec<f32> = out.latent_next_obs.to_vec1().unwrap();
        assert_eq!(next, vec![11.0, 18.0, 30.5, 43.0]);
    }

    #[test]
    fn test_delta_mode_zero_head_is_identity() {
        let mut model = bias_only_model(true, &[0.0; LATENT], 0.0);
        let s = state([0.25, -1.0, 7.0, 0.0]);
        let out = model.predict(&s, &one_hot(0)).unwrap();
        let next: Vec<f32> = out.latent_next_obs.to_vec1().unwrap();
        assert_eq!(next, s.to_vec1::<f32>().unwrap());
    }

    #[test]
    fn test_deterministic_without_memo() {
        let mut model = random_model(true);
        let s = state([0.3, -0.1, 0.9, 0.0]);
        let a = one_hot(1);
        let first = model.predict(&s, &a).unwrap();
        let second = model.predict(&s, &a).unwrap();
        assert!(!first.memo_hit && !second.memo_hit);
        assert_eq!(
            first.latent_next_obs.to_vec1::<f32>().unwrap(),
            second.latent_next_obs.to_vec1::<f32>().unwrap()
        );
        assert_eq!(
            first.reward.to_vec1::<f32>().unwrap(),
            second.reward.to_vec1::<f32>().unwrap()
        );
        assert_eq!(model.memo_len(), 0);
    }

    #[test]
    fn test_term_in_open_unit_interval() {
        let mut model = random_model(false);
        let device = Device::Cpu;
        let s = Tensor::randn(0f32, 3f32, (64, LATENT), &device).unwrap();
        let a = Tensor::randn(0f32, 1f32, (64, ACTIONS), &device).unwrap();
        let out = model.predict(&s, &a).unwrap();
        let term: Vec<Vec<f32>> = out.term.to_vec2().unwrap();
        for row in term {
            assert!(row[0] > 0.0 && row[0] < 1.0, "term {} out of range", row[0]);
        }
    }

    #[test]
    fn test_term_never_saturates() {
        for logit in [30.0f32, 100.0, -100.0, -120.0] {
            let mut model = bias_only_model_with_term(false, &[0.0; LATENT], 0.0, logit);
            let out = model.predict(&state([0.0; LATENT]), &one_hot(0)).unwrap();
            let term: Vec<f32> = out.term.to_vec1().unwrap();
            assert!(term[0] > 0.0 && term[0] < 1.0, "logit {logit} gave term {}", term[0]);
        }
    }

    #[test]
    fn test_shape_mismatch() {
        let mut model = random_model(false);
        let device = Device::Cpu;
        let wide = Tensor::zeros(LATENT + 1, DType::F32, &device).unwrap();
        let err = model.predict(&wide, &one_hot(0)).unwrap_err();
        assert!(matches!(err, DynamicsError::ShapeMismatch { .. }));

        let bad_action = Tensor::zeros(ACTIONS + 2, DType::F32, &device).unwrap();
        let err = model.predict(&state([0.0; LATENT]), &bad_action).unwrap_err();
        assert!(matches!(err, DynamicsError::ShapeMismatch { .. }));

        let batch = Tensor::zeros((2, LATENT), DType::F32, &device).unwrap();
        let err = model.predict(&batch, &one_hot(0)).unwrap_err();
        assert!(matches!(err, DynamicsError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_zero_dims_rejected() {
        let varmap = VarMap::new();
        let config = DynamicsConfig::new(0, ACTIONS).with_device("cpu");
        assert!(LatentDynamicsModel::from_config(&config, &varmap).is_err());
    }

    #[test]
    fn test_run_is_predict() {
        let mut model = bias_only_model(false, &[1.0, 2.0, 3.0, 4.0], 0.0);
        let out = model.run(&state([0.0; LATENT]), &one_hot(0)).unwrap();
        let (next, _, _, hit) = out.into_parts();
        assert_eq!(next.to_vec1::<f32>().unwrap(), vec![1.0, 2.0, 3.0, 4.0]);
        assert!(!hit);
    }

    #[test]
    fn test_memo_hit_returns_stored_triple() {
        let mut model = random_model(false);
        model.start_memoize();
        let s = state([0.1, 0.2, 0.3, 0.4]);
        let a = one_hot(2);
        let first = model.predict(&s, &a).unwrap();
        let second = model.predict(&s, &a).unwrap();
        assert!(!first.memo_hit);
        assert!(second.memo_hit);
        assert_eq!(
            first.latent_next_obs.to_vec1::<f32>().unwrap(),
            second.latent_next_obs.to_vec1::<f32>().unwrap()
        );
        assert_eq!(
            first.term.to_vec1::<f32>().unwrap(),
            second.term.to_vec1::<f32>().unwrap()
        );
        assert_eq!(model.memo_len(), 1);
    }

    #[test]
    fn test_batched_query_rejected_while_memoizing() {
        let mut model = random_model(false);
        let device = Device::Cpu;
        let s = Tensor::zeros((3, LATENT), DType::F32, &device).unwrap();
        let a = Tensor::zeros((3, ACTIONS), DType::F32, &device).unwrap();
        model.start_memoize();
        let err = model.predict(&s, &a).unwrap_err();
        assert!(matches!(err, DynamicsError::BatchedMemoQuery { rows: 3 }));
        assert_eq!(model.memo_len(), 0);

        model.stop_memoize();
        assert!(model.predict(&s, &a).is_ok());
    }

    #[test]
    fn test_single_row_batch_memoized() {
        let mut model = random_model(false);
        let device = Device::Cpu;
        let s = Tensor::zeros((1, LATENT), DType::F32, &device).unwrap();
        let a = Tensor::ones((1, ACTIONS), DType::F32, &device).unwrap();
        model.start_memoize();
        assert!(!model.predict(&s, &a).unwrap().memo_hit);
        assert!(model.predict(&s, &a).unwrap().memo_hit);
    }
}
