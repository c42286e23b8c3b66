use anyhow::{bail, Result};
use candle_core::{Device, Tensor};
use candle_nn::VarMap;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::Instant;
use tracing_subscriber::EnvFilter;

use latent_dynamics::{DynamicsConfig, LatentDynamicsModel};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let args: Vec<String> = std::env::args().collect();

    // Random-action rollouts from one root latent, replayed to show memo reuse
    if args.len() >= 2 && (args[1] == "--rollout" || args[1] == "rollout") {
        let (config, rest) = DynamicsConfig::from_args_after(&args[2..])?;
        let depth = rest.first().and_then(|v| v.parse().ok()).unwrap_or(4);
        let rollouts = rest.get(1).and_then(|v| v.parse().ok()).unwrap_or(32);
        let seed = rest.get(2).and_then(|v| v.parse().ok()).unwrap_or(7);
        return run_rollout(config, depth, rollouts, seed);
    }

    eprintln!("usage:");
    eprintln!(
        "    {} rollout [latent_dim] [action_dim] [depth] [rollouts] [seed] [--delta] [--device <cpu|cuda:N|metal:N>] [--config <file.json>]",
        args[0]
    );
    bail!("specify a mode: rollout");
}

#[derive(Default)]
struct PassStats {
    hits: usize,
    misses: usize,
    terminated: usize,
    total_reward: f32,
}

fn run_rollout(config: DynamicsConfig, depth: usize, rollouts: usize, seed: u64) -> Result<()> {
    let varmap = VarMap::new();
    let mut model = LatentDynamicsModel::from_config(&config, &varmap)?;
    let device = model.device().clone();
    println!(
        "Latent dynamics rollout: latent_dim {} action_dim {} delta_mode {} depth {} rollouts {}",
        config.latent_state_dim, config.action_dim, config.delta_mode, depth, rollouts
    );

    let root = Tensor::randn(0f32, 1f32, config.latent_state_dim, &device)?;
    model.start_memoize();

    // The second pass replays the same action sequences, so every query should hit.
    for pass in 1..=2 {
        let mut rng = StdRng::seed_from_u64(seed);
        let started = Instant::now();
        let stats = run_pass(&mut model, &root, depth, rollouts, &mut rng)?;
        let queries = stats.hits + stats.misses;
        let hit_rate = if queries > 0 {
            stats.hits as f32 / queries as f32
        } else {
            0.0
        };
        println!(
            "pass {pass}: queries {queries} hits {} misses {} hit_rate {hit_rate:.3} terminated {} mean_return {:.4} memos {} elapsed {:.2?}",
            stats.hits,
            stats.misses,
            stats.terminated,
            stats.total_reward / rollouts.max(1) as f32,
            model.memo_len(),
            started.elapsed()
        );
    }

    model.stop_memoize();
    model.clear_memos();
    Ok(())
}

fn run_pass(
    model: &mut LatentDynamicsModel,
    root: &Tensor,
    depth: usize,
    rollouts: usize,
    rng: &mut StdRng,
) -> Result<PassStats> {
    let mut stats = PassStats::default();
    let action_dim = model.action_dim();
    let device = model.device().clone();
    for _ in 0..rollouts {
        let mut latent = root.clone();
        for _ in 0..depth {
            let action = one_hot(rng.gen_range(0..action_dim), action_dim, &device)?;
            let pred = model.predict(&latent, &action)?;
            if pred.memo_hit {
                stats.hits += 1;
            } else {
                stats.misses += 1;
            }
            stats.total_reward += pred.reward.squeeze(0)?.to_scalar::<f32>()?;
            if pred.term.squeeze(0)?.to_scalar::<f32>()? > 0.5 {
                stats.terminated += 1;
                break;
            }
            latent = pred.latent_next_obs;
        }
    }
    Ok(stats)
}

fn one_hot(index: usize, action_dim: usize, device: &Device) -> Result<Tensor> {
    let mut v = vec![0f32; action_dim];
    v[index] = 1.0;
    Ok(Tensor::from_vec(v, action_dim, device)?)
}
