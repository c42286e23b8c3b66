pub mod dynamics;
pub mod memo;

pub use dynamics::{LatentDynamicsModel, Prediction, HEAD_DIM, HIDDEN_DIM};
pub use memo::{HashedTensor, MemoEntry, MemoStore};
