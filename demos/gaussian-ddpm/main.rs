// Samples from a diffusion model whose noise predictor is known in closed
// form: each class of the data is a gaussian, so no trained weights are needed
// to check that the reverse process reproduces the data distribution.
//
//   cargo run --release --example gaussian-ddpm --features clap,tracing-subscriber -- \
//       --mean -2 --mean 2 --std 0.5 --guidance-scale 2
//
// The schedule can be read from a TOML file, see configs/ddpm.default.toml.
use clap::Parser;
use tch::{Device, Kind, Tensor};
use tiny_ddpm::{
    models::gaussian::GaussianDenoiser,
    noise::TorchNoise,
    pipelines::ddpm::DdpmSampler,
    schedulers::{ddpm::NoiseSchedule, NoiseScheduleConfig},
};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TOML file holding the noise schedule configuration.
    #[arg(long, value_name = "FILE")]
    config: Option<String>,

    /// Overrides the number of diffusion steps of the configuration.
    #[arg(long)]
    timesteps: Option<usize>,

    /// The number of samples to generate.
    #[arg(long, default_value_t = 64)]
    n_samples: i64,

    /// The mean of each class of the data, repeat the flag for several classes.
    #[arg(long, default_values_t = [0.], allow_negative_numbers = true)]
    mean: Vec<f64>,

    /// The standard deviation shared by all classes.
    #[arg(long, default_value_t = 1.)]
    std: f64,

    /// Classifier-free guidance scale, only used with several classes.
    #[arg(long)]
    guidance_scale: Option<f64>,

    /// Logs the sample statistics every this many steps.
    #[arg(long)]
    trajectory_every: Option<usize>,

    /// The seed used for the random generator.
    #[arg(long, default_value_t = 32)]
    seed: i64,

    /// When set, use the CPU even if some accelerator is available.
    #[arg(long)]
    cpu: bool,

    /// Enables debug logging.
    #[arg(long)]
    verbose: bool,
}

// Mean and standard deviation of the samples of each class.
fn class_stats(samples: &Tensor, classes: &Tensor, n_classes: usize) -> Vec<(f64, f64)> {
    (0..n_classes as i64)
        .map(|class| {
            let mask = classes.eq(class).nonzero().squeeze_dim(-1);
            let xs = samples.index_select(0, &mask).to_kind(Kind::Double);
            (xs.mean(Kind::Double).double_value(&[]), xs.std(true).double_value(&[]))
        })
        .collect()
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let mut config = match &args.config {
        Some(path) => NoiseScheduleConfig::from_file(path)?,
        None => NoiseScheduleConfig::default(),
    };
    if let Some(timesteps) = args.timesteps {
        config.train_timesteps = timesteps;
    }
    let schedule = NoiseSchedule::from_config(&config)?;
    info!(?config, "noise schedule ready");

    let device = tiny_ddpm::utils::device(args.cpu);
    info!(?device, "selected device");
    tch::manual_seed(args.seed);

    let n_classes = args.mean.len();
    let denoiser = GaussianDenoiser::with_class_means(&schedule, args.mean.clone(), args.std)?;
    // Cycling through the class indices is only a convenience, any per-sample
    // labels would do.
    let classes = Tensor::arange(args.n_samples, (Kind::Int64, device)).remainder(n_classes as i64);
    let condition = if n_classes > 1 { Some(&classes) } else { None };

    let mut sampler = DdpmSampler::new(&schedule).with_device(device);
    if let (Some(guidance_scale), Some(_)) = (args.guidance_scale, condition) {
        sampler = sampler.with_guidance_scale(guidance_scale);
    }

    let shape = [1, 8, 8];
    let samples = match args.trajectory_every {
        Some(every) => {
            let (samples, trajectory) = sampler.sample_with_trajectory(
                &denoiser,
                &shape,
                args.n_samples,
                condition,
                &mut TorchNoise,
                every,
            )?;
            for (timestep, xs) in trajectory.iter() {
                let xs = xs.to_kind(Kind::Double);
                info!(
                    timestep,
                    mean = xs.mean(Kind::Double).double_value(&[]),
                    std = xs.std(true).double_value(&[]),
                    "intermediate state"
                );
            }
            samples
        }
        None => sampler.sample(&denoiser, &shape, args.n_samples, condition, &mut TorchNoise)?,
    };

    let samples = samples.to_device(Device::Cpu);
    let classes = classes.to_device(Device::Cpu);
    for (class, (mean, std)) in class_stats(&samples, &classes, n_classes).into_iter().enumerate() {
        println!(
            "class {class}: target mean {:.3} std {:.3}, sampled mean {mean:.3} std {std:.3}",
            args.mean[class], args.std
        );
    }
    Ok(())
}
