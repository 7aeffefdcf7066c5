use crate::{
    checkpoint,
    error::{Error, Result},
    grid,
    model::{self, Mixing, StyledGenerator, SynthesisOptions, Synthesizer},
};
use std::{fs::create_dir_all, path::PathBuf};
use tch::{nn, Device, Kind, Tensor};
use tracing::info;

const MEAN_STYLE_BATCHES: i64 = 10;
const MEAN_STYLE_BATCH_SIZE: i64 = 1024;
const SAMPLE_COUNT: i64 = 15;
const SOURCE_COUNT: i64 = 5;
const TARGET_COUNT: i64 = 3;
const ALPHA: f64 = 1.;
const STYLE_WEIGHT: f64 = 0.7;
const MIXING_RANGE: Mixing = Mixing::Range(0, 1);
const MIXING_GRIDS: u64 = 20;

pub struct Config {
    pub checkpoint: PathBuf,
    pub size: u32,
    pub key: String,
    pub out_dir: PathBuf,
    pub seed: Option<i64>,
}

/// Resolution step for an output `size`: `log2(size) - 2`.
pub fn resolution_step(size: u32) -> Result<i64> {
    let step = i64::from(size.trailing_zeros()) - 2;
    if !size.is_power_of_two() || !(0..=model::MAX_STEP).contains(&step) {
        return Err(Error::InvalidSize(size));
    }
    Ok(step)
}

pub fn average(first: Tensor, rest: impl Iterator<Item = Tensor>) -> Tensor {
    let (sum, count) = rest.fold((first, 1), |(acc, count), s| (acc + s, count + 1));
    sum / f64::from(count)
}

pub fn mean_style(generator: &impl Synthesizer, device: Device) -> Tensor {
    let batch = || generator.mean_style(&model::rand_latent(MEAN_STYLE_BATCH_SIZE, device));
    average(batch(), (1..MEAN_STYLE_BATCHES).map(|_| batch()))
}

fn options(step: i64, mean_style: &Tensor, mixing: Mixing) -> SynthesisOptions {
    SynthesisOptions {
        step,
        alpha: ALPHA,
        mean_style: Some(mean_style),
        style_weight: STYLE_WEIGHT,
        mixing,
    }
}

pub fn sample(
    generator: &impl Synthesizer,
    step: i64,
    mean_style: &Tensor,
    device: Device,
) -> Tensor {
    let latent = model::rand_latent(SAMPLE_COUNT, device);
    generator.synthesize(&[latent], &options(step, mean_style, Mixing::Crossover))
}

/// Pieces of a style-mixing grid, in display order: a blank tile, the source
/// row, then each target followed by its row mixed with every source.
pub fn mixing_segments(
    generator: &impl Synthesizer,
    step: i64,
    mean_style: &Tensor,
    device: Device,
) -> Vec<Tensor> {
    let source_code = model::rand_latent(SOURCE_COUNT, device);
    let target_code = model::rand_latent(TARGET_COUNT, device);
    let shape = 4 << step;
    let plain = options(step, mean_style, Mixing::Crossover);

    let mut images = vec![Tensor::ones(&[1, 3, shape, shape], (Kind::Float, device)) * -1.];
    let source_image = generator.synthesize(&[source_code.shallow_clone()], &plain);
    let target_image = generator.synthesize(&[target_code.shallow_clone()], &plain);
    images.push(source_image);

    let mixed = options(step, mean_style, MIXING_RANGE);
    for i in 0..TARGET_COUNT {
        let target = target_code.narrow(0, i, 1).repeat(&[SOURCE_COUNT, 1]);
        let image = generator.synthesize(&[target, source_code.shallow_clone()], &mixed);
        images.push(target_image.narrow(0, i, 1));
        images.push(image);
    }
    images
}

pub fn style_mixing(
    generator: &impl Synthesizer,
    step: i64,
    mean_style: &Tensor,
    device: Device,
) -> Tensor {
    Tensor::cat(&mixing_segments(generator, step, mean_style, device), 0)
}

pub fn generate(config: &Config) -> Result<()> {
    let step = resolution_step(config.size)?;
    let device = Device::cuda_if_available();
    if !config.out_dir.is_dir() {
        create_dir_all(&config.out_dir)?;
    }

    let mut generator_vs = nn::VarStore::new(device);
    let generator = StyledGenerator::new(&generator_vs.root());
    checkpoint::load(&mut generator_vs, &config.checkpoint, &config.key)?;
    if let Some(seed) = config.seed {
        tch::manual_seed(seed);
    }
    info!("sampling {0}x{0} images (step {1}) on {2:?}", config.size, step, device);

    tch::no_grad(|| -> Result<()> {
        let mean_style = mean_style(&generator, device);
        let img = sample(&generator, step, &mean_style, device);
        let path = config.out_dir.join("sample.png");
        grid::save_grid(&img, 5, &path)?;
        info!("wrote {:?}", path);

        let pb = indicatif::ProgressBar::new(MIXING_GRIDS);
        for j in 0..MIXING_GRIDS {
            pb.set_position(j);
            let img = style_mixing(&generator, step, &mean_style, device);
            grid::save_grid(&img, 6, config.out_dir.join(format!("sample_mixing_{}.png", j)))?;
        }
        pb.finish();
        info!("wrote {} style-mixing grids to {:?}", MIXING_GRIDS, config.out_dir);
        Ok(())
    })
}
