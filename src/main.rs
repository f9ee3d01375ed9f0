// =============================================================================
// Sonic the Hedgehog (Genesis) — DQN contest agent in Rust
// =============================================================================
// Build & Run:
//   cargo build --release
//   cargo run --release -- build --environment sim --max-step-count 100000
//   cargo run --release -- validate --load-model model --allow-fresh
//   RUST_LOG=debug cargo run --release -- build --tracking

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Result};
use candle_core::Device;
use clap::{Parser, Subcommand, ValueEnum};
use tracing::warn;

use sonic_dqn::checkpoint;
use sonic_dqn::env::{Environment, RemoteEnv, SimCorridorEnv};
use sonic_dqn::metrics::{Evaluator, NotablePolicy};
use sonic_dqn::model::ConvQNet;
use sonic_dqn::store::DirStore;
use sonic_dqn::trainer::{Mode, Trainer, TrainerConfig};
use sonic_dqn::ScreenConfig;

// =============================================================================
// CLI
// =============================================================================

#[derive(Parser)]
#[command(name = "sonic-dqn", about = "Sonic the Hedgehog Genesis — DQN contest agent")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Train the agent
    Build(BuildArgs),
    /// Watch the trained agent play greedily
    Validate(ValidateArgs),
    /// Score the agent on the held-out contest levels
    Test(TestArgs),
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum EnvTarget {
    /// Built-in deterministic corridor, no external process needed
    Sim,
    /// Contest simulator over a Unix domain socket
    Remote,
}

#[derive(Parser)]
struct CommonArgs {
    #[arg(long, value_enum, default_value_t = EnvTarget::Sim)]
    environment: EnvTarget,
    /// Simulator socket path, for --environment remote
    #[arg(long, default_value = "tmp/sock")]
    socket: PathBuf,
    /// Root for the telemetry object store
    #[arg(long, default_value = "logs")]
    log_folder: PathBuf,
    /// Checkpoint directory to resume from
    #[arg(long)]
    load_model: Option<PathBuf>,
    #[arg(long, default_value = "100000")]
    max_step_count: u64,
    /// Record the heavy diagnostic payload for every step
    #[arg(long, default_value_t = false)]
    tracking: bool,
    #[arg(long, default_value_t = false)]
    render: bool,
    #[arg(long, default_value = "320")]
    screen_width: usize,
    #[arg(long, default_value = "224")]
    screen_height: usize,
    #[arg(long, default_value_t = false)]
    grayscale: bool,
}

#[derive(Parser)]
struct BuildArgs {
    #[command(flatten)]
    common: CommonArgs,
    #[arg(long, default_value = "0.10")]
    epsilon: f64,
    #[arg(long, default_value = "0.99")]
    gamma: f64,
    #[arg(long, default_value = "0.0001")]
    learning_rate: f64,
    /// Initial Q-head bias on RIGHT-running actions
    #[arg(long, default_value = "0.0")]
    right_bias: f64,
    /// Checkpoint directory to write
    #[arg(long, default_value = "model")]
    output: PathBuf,
    #[arg(long, default_value = "10000")]
    save_interval: u64,
    #[arg(long, default_value = "1000")]
    forecast_refresh_interval: u64,
    #[arg(long, default_value = "16")]
    batch_size: usize,
    #[arg(long, default_value = "100000")]
    memory_capacity: usize,
    #[arg(long)]
    seed: Option<u64>,
}

#[derive(Parser)]
struct ValidateArgs {
    #[command(flatten)]
    common: CommonArgs,
    /// Run with freshly initialized weights when no --load-model is given
    #[arg(long, default_value_t = false)]
    allow_fresh: bool,
}

#[derive(Parser)]
struct TestArgs {
    #[command(flatten)]
    common: CommonArgs,
    #[arg(long, default_value_t = false)]
    allow_fresh: bool,
}

// =============================================================================
// Main
// =============================================================================

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()))
        .init();

    let cli = Cli::parse();

    match &cli.command {
        Commands::Build(args) => build(args),
        Commands::Validate(args) => validate(args),
        Commands::Test(args) => test(args),
    }
}

fn screen_config(common: &CommonArgs) -> Result<ScreenConfig> {
    let screen = ScreenConfig {
        width: common.screen_width,
        height: common.screen_height,
        grayscale: common.grayscale,
    };
    screen.validate()?;
    Ok(screen)
}

fn evaluator(common: &CommonArgs) -> Evaluator {
    let policy = if common.tracking {
        NotablePolicy::Always
    } else {
        NotablePolicy::Never
    };
    Evaluator::new(
        Box::new(DirStore::new(&common.log_folder)),
        1000,
        Duration::from_secs(60),
        policy,
    )
}

fn environment(common: &CommonArgs, screen: &ScreenConfig, device: &Device) -> Result<Box<dyn Environment>> {
    Ok(match common.environment {
        EnvTarget::Sim => Box::new(SimCorridorEnv::new(screen.clone(), 256, device.clone())),
        EnvTarget::Remote => Box::new(RemoteEnv::connect(&common.socket, screen.clone(), device.clone())?),
    })
}

fn load_or_fresh(
    common: &CommonArgs,
    allow_fresh: bool,
    screen: &ScreenConfig,
    device: &Device,
) -> Result<ConvQNet> {
    match &common.load_model {
        Some(dir) => {
            let (model, _meta) = checkpoint::load(dir, screen, device)?;
            Ok(model)
        }
        None if allow_fresh => {
            warn!("no checkpoint given; running with freshly initialized weights");
            ConvQNet::new(screen, device)
        }
        None => bail!("no --load-model given; pass --allow-fresh to run untrained weights"),
    }
}

fn build(args: &BuildArgs) -> Result<()> {
    let device = Device::Cpu;
    let screen = screen_config(&args.common)?;

    let model = match &args.common.load_model {
        Some(dir) => checkpoint::load(dir, &screen, &device)?.0,
        None => {
            let model = ConvQNet::new(&screen, &device)?;
            model.apply_right_bias(args.right_bias)?;
            model
        }
    };

    let cfg = TrainerConfig {
        mode: Mode::Build,
        gamma: args.gamma,
        epsilon: args.epsilon,
        learning_rate: args.learning_rate,
        batch_size: args.batch_size,
        memory_capacity: args.memory_capacity,
        forecast_refresh_interval: args.forecast_refresh_interval,
        save_interval: args.save_interval,
        max_step_count: args.common.max_step_count,
        checkpoint_dir: args.output.clone(),
        right_bias: args.right_bias,
        seed: args.seed,
        render: args.common.render,
    };
    let env = environment(&args.common, &screen, &device)?;
    let mut trainer = Trainer::new(cfg, model, env, evaluator(&args.common), device)?;
    trainer.run()
}

fn validate(args: &ValidateArgs) -> Result<()> {
    let device = Device::Cpu;
    let screen = screen_config(&args.common)?;
    let model = load_or_fresh(&args.common, args.allow_fresh, &screen, &device)?;

    let cfg = TrainerConfig {
        mode: Mode::Validate,
        max_step_count: args.common.max_step_count,
        render: args.common.render,
        ..TrainerConfig::default()
    };
    let env = environment(&args.common, &screen, &device)?;
    let mut trainer = Trainer::new(cfg, model, env, evaluator(&args.common), device)?;
    trainer.run()
}

fn test(args: &TestArgs) -> Result<()> {
    let device = Device::Cpu;
    let screen = screen_config(&args.common)?;
    let _model = load_or_fresh(&args.common, args.allow_fresh, &screen, &device)?;
    bail!("test scoring against the held-out contest levels is not implemented yet")
}
