//! Latent-space dynamics model for model-based reinforcement learning.
//!
//! Given a latent observation and a one-hot action, [`LatentDynamicsModel`]
//! predicts the next latent observation, the reward and the probability that the
//! episode terminates. Planners that query the same (state, action) pair many
//! times can turn on memoization to reuse exact-match results.
//!
//! # Example
//!
//! ```no_run
//! use candle_core::{Device, Tensor};
//! use candle_nn::VarMap;
//! use latent_dynamics::{DynamicsConfig, LatentDynamicsModel};
//!
//! let varmap = VarMap::new();
//! let config = DynamicsConfig::new(16, 4).with_delta_mode(true);
//! let mut model = LatentDynamicsModel::from_config(&config, &varmap).unwrap();
//!
//! let latent = Tensor::zeros(16, candle_core::DType::F32, model.device()).unwrap();
//! let action = Tensor::new(&[0f32, 1.0, 0.0, 0.0], &Device::Cpu).unwrap();
//!
//! model.start_memoize();
//! let first = model.predict(&latent, &action).unwrap();
//! let again = model.predict(&latent, &action).unwrap();
//! assert!(!first.memo_hit && again.memo_hit);
//! ```

pub mod config;
pub mod device;
pub mod error;
pub mod model;

pub use config::DynamicsConfig;
pub use device::select_device;
pub use error::{DynamicsError, DynamicsResult};
pub use model::{HashedTensor, LatentDynamicsModel, MemoStore, Prediction};
