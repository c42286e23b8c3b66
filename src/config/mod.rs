pub mod config;

pub use config::DynamicsConfig;
