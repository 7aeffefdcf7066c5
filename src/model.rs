// Style-based generator (progressive-growing variant).
// https://arxiv.org/abs/1812.04948
use tch::{nn, Device, Kind, Tensor};

pub const LATENT_DIM: i64 = 512;
/// Deepest resolution step the generator has blocks for (1024x1024).
pub const MAX_STEP: i64 = 8;
const N_MLP: i64 = 8;
const CHANNELS: [i64; 9] = [512, 512, 512, 512, 256, 128, 64, 32, 16];
// Blocks from 128x128 upwards use the fused transposed convolution.
const FUSED_FROM: usize = 5;

/// How styles are assigned to generator blocks when several latent batches are given.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mixing {
    /// Switch to the next style at randomly drawn block boundaries.
    Crossover,
    /// Blocks in `lo..=hi` take the second style, all others the first.
    Range(i64, i64),
}

#[derive(Debug, Clone, Copy)]
pub struct SynthesisOptions<'a> {
    pub step: i64,
    pub alpha: f64,
    pub mean_style: Option<&'a Tensor>,
    pub style_weight: f64,
    pub mixing: Mixing,
}

/// The two capabilities the sampling code needs from a generator.
pub trait Synthesizer {
    /// Style-map a latent batch and average it to a single `[1, LATENT_DIM]` style.
    fn mean_style(&self, latent: &Tensor) -> Tensor;
    /// Synthesize a `[batch, 3, 4 * 2^step, 4 * 2^step]` image batch.
    fn synthesize(&self, latents: &[Tensor], options: &SynthesisOptions) -> Tensor;
}

// Equalized learning rate: weights are stored unscaled and multiplied at use time.
fn equal_lr_scale(weight: &Tensor) -> f64 {
    let size = weight.size();
    let fan_in = size[1] * size[2..].iter().product::<i64>();
    (2. / fan_in as f64).sqrt()
}

pub fn leaky_relu(v: f64) -> impl Fn(&Tensor) -> Tensor + Send + 'static {
    move |x| x.maximum(&(x * v))
}

fn pixel_norm(xs: &Tensor) -> Tensor {
    xs / ((xs * xs).mean_dim(&[1], true, Kind::Float) + 1e-8).sqrt()
}

fn instance_norm(xs: &Tensor) -> Tensor {
    let mean = xs.mean_dim(&[2, 3], true, Kind::Float);
    let centered = xs - mean;
    let var = (&centered * &centered).mean_dim(&[2, 3], true, Kind::Float);
    centered / (var + 1e-5).sqrt()
}

fn upsample_nearest(xs: &Tensor) -> Tensor {
    let size = xs.size();
    let (b, c, h, w) = (size[0], size[1], size[2], size[3]);
    xs.unsqueeze(3)
        .unsqueeze(5)
        .expand(&[b, c, h, 2, w, 2], false)
        .reshape(&[b, c, h * 2, w * 2])
}

#[derive(Debug)]
struct EqualLinear {
    weight: Tensor,
    bias: Tensor,
}

fn equal_linear(p: &nn::Path, in_dim: i64, out_dim: i64) -> EqualLinear {
    let p = p / "linear";
    EqualLinear {
        weight: p.randn_standard("weight_orig", &[out_dim, in_dim]),
        bias: p.zeros("bias", &[out_dim]),
    }
}

impl nn::Module for EqualLinear {
    fn forward(&self, xs: &Tensor) -> Tensor {
        xs.matmul(&(&self.weight * equal_lr_scale(&self.weight)).tr()) + &self.bias
    }
}

#[derive(Debug)]
struct EqualConv2d {
    weight: Tensor,
    bias: Tensor,
    padding: i64,
}

fn equal_conv2d(p: &nn::Path, c_in: i64, c_out: i64, ksize: i64, padding: i64) -> EqualConv2d {
    let p = p / "conv";
    EqualConv2d {
        weight: p.randn_standard("weight_orig", &[c_out, c_in, ksize, ksize]),
        bias: p.zeros("bias", &[c_out]),
        padding,
    }
}

impl nn::Module for EqualConv2d {
    fn forward(&self, xs: &Tensor) -> Tensor {
        let weight = &self.weight * equal_lr_scale(&self.weight);
        xs.conv2d(
            &weight,
            Some(&self.bias),
            &[1, 1],
            &[self.padding, self.padding],
            &[1, 1],
            1,
        )
    }
}

/// 2x upsampling transposed convolution whose kernel is pre-blurred by a 2x2 box filter.
#[derive(Debug)]
struct FusedUpsample {
    weight: Tensor,
    bias: Tensor,
    padding: i64,
}

fn fused_upsample(p: &nn::Path, c_in: i64, c_out: i64, ksize: i64, padding: i64) -> FusedUpsample {
    FusedUpsample {
        weight: p.randn_standard("weight", &[c_in, c_out, ksize, ksize]),
        bias: p.zeros("bias", &[c_out]),
        padding,
    }
}

impl nn::Module for FusedUpsample {
    fn forward(&self, xs: &Tensor) -> Tensor {
        let size = self.weight.size();
        let multiplier = (2. / (size[0] * size[2] * size[3]) as f64).sqrt();
        let weight = (&self.weight * multiplier).constant_pad_nd(&[1, 1, 1, 1]);
        let len = size[2] + 1;
        let shifted = |dy: i64, dx: i64| weight.narrow(2, dy, len).narrow(3, dx, len);
        let weight = (shifted(1, 1) + shifted(0, 1) + shifted(1, 0) + shifted(0, 0)) / 4.;
        xs.conv_transpose2d(
            &weight,
            Some(&self.bias),
            &[2, 2],
            &[self.padding, self.padding],
            &[0, 0],
            1,
            &[1, 1],
        )
    }
}

#[derive(Debug)]
struct Blur {
    kernel: Tensor,
    channel: i64,
}

fn blur(channel: i64, device: Device) -> Blur {
    let kernel = Tensor::of_slice(&[1f32, 2., 1., 2., 4., 2., 1., 2., 1.]).view([1, 1, 3, 3]) / 16.;
    Blur {
        kernel: kernel.repeat(&[channel, 1, 1, 1]).to_device(device),
        channel,
    }
}

impl nn::Module for Blur {
    fn forward(&self, xs: &Tensor) -> Tensor {
        xs.conv2d(&self.kernel, None::<Tensor>, &[1, 1], &[1, 1], &[1, 1], self.channel)
    }
}

#[derive(Debug)]
struct NoiseInjection {
    weight: Tensor,
}

impl NoiseInjection {
    fn new(p: &nn::Path, channel: i64) -> Self {
        Self {
            weight: p.zeros("weight_orig", &[1, channel, 1, 1]),
        }
    }

    fn forward(&self, xs: &Tensor, noise: &Tensor) -> Tensor {
        xs + &self.weight * equal_lr_scale(&self.weight) * noise
    }
}

#[derive(Debug)]
struct AdaptiveInstanceNorm {
    style: EqualLinear,
}

impl AdaptiveInstanceNorm {
    fn new(p: &nn::Path, channel: i64) -> Self {
        let p = p / "style";
        let lin = &p / "linear";
        let bias = Tensor::cat(
            &[
                Tensor::ones(&[channel], (Kind::Float, Device::Cpu)),
                Tensor::zeros(&[channel], (Kind::Float, Device::Cpu)),
            ],
            0,
        );
        let style = EqualLinear {
            weight: lin.randn_standard("weight_orig", &[channel * 2, LATENT_DIM]),
            bias: lin.var_copy("bias", &bias),
        };
        Self { style }
    }

    fn forward(&self, xs: &Tensor, style: &Tensor) -> Tensor {
        let style = style.apply(&self.style).unsqueeze(2).unsqueeze(3);
        let gamma_beta = style.chunk(2, 1);
        &gamma_beta[0] * instance_norm(xs) + &gamma_beta[1]
    }
}

#[derive(Debug)]
enum FirstConv {
    /// Learned 4x4 input, repeated over the batch.
    Constant(Tensor),
    Upsample { conv: EqualConv2d, blur: Blur },
    Fused { conv: FusedUpsample, blur: Blur },
}

#[derive(Debug)]
struct StyledConvBlock {
    conv1: FirstConv,
    noise1: NoiseInjection,
    adain1: AdaptiveInstanceNorm,
    conv2: EqualConv2d,
    noise2: NoiseInjection,
    adain2: AdaptiveInstanceNorm,
}

impl StyledConvBlock {
    fn new(p: &nn::Path, index: usize, c_in: i64, c_out: i64) -> Self {
        let conv1 = p / "conv1";
        let conv1 = if index == 0 {
            FirstConv::Constant(conv1.randn_standard("input", &[1, c_in, 4, 4]))
        } else if index < FUSED_FROM {
            FirstConv::Upsample {
                conv: equal_conv2d(&(&conv1 / 1), c_in, c_out, 3, 1),
                blur: blur(c_out, p.device()),
            }
        } else {
            FirstConv::Fused {
                conv: fused_upsample(&(&conv1 / 0), c_in, c_out, 3, 1),
                blur: blur(c_out, p.device()),
            }
        };
        Self {
            conv1,
            noise1: NoiseInjection::new(&(p / "noise1"), c_out),
            adain1: AdaptiveInstanceNorm::new(&(p / "adain1"), c_out),
            conv2: equal_conv2d(&(p / "conv2"), c_out, c_out, 3, 1),
            noise2: NoiseInjection::new(&(p / "noise2"), c_out),
            adain2: AdaptiveInstanceNorm::new(&(p / "adain2"), c_out),
        }
    }

    fn forward(&self, xs: &Tensor, style: &Tensor, noise: &Tensor) -> Tensor {
        let act = leaky_relu(0.2);
        let out = match &self.conv1 {
            FirstConv::Constant(input) => input.repeat(&[xs.size()[0], 1, 1, 1]),
            FirstConv::Upsample { conv, blur } => upsample_nearest(xs).apply(conv).apply(blur),
            FirstConv::Fused { conv, blur } => xs.apply(conv).apply(blur),
        };
        let out = self.adain1.forward(&act(&self.noise1.forward(&out, noise)), style);
        let out = out.apply(&self.conv2);
        self.adain2.forward(&act(&self.noise2.forward(&out, noise)), style)
    }
}

#[derive(Debug)]
struct Generator {
    progression: Vec<StyledConvBlock>,
    to_rgb: Vec<EqualConv2d>,
}

// Sorted block indices after which crossover mode moves on to the next style.
fn crossover_points(step: i64, count: usize) -> Vec<i64> {
    let count = (count as i64).min(step);
    let perm = Tensor::randperm(step, (Kind::Int64, Device::Cpu));
    let mut points = Vec::<i64>::from(&perm.narrow(0, 0, count));
    points.sort_unstable();
    points
}

impl Generator {
    fn new(p: &nn::Path) -> Self {
        let progression = p / "progression";
        let to_rgb = p / "to_rgb";
        let blocks = CHANNELS.iter().enumerate().map(|(i, &c_out)| {
            let c_in = if i == 0 { CHANNELS[0] } else { CHANNELS[i - 1] };
            StyledConvBlock::new(&(&progression / i), i, c_in, c_out)
        });
        Self {
            progression: blocks.collect(),
            to_rgb: CHANNELS
                .iter()
                .enumerate()
                .map(|(i, &c)| equal_conv2d(&(&to_rgb / i), c, 3, 1, 0))
                .collect(),
        }
    }

    fn forward(
        &self,
        styles: &[Tensor],
        noise: &[Tensor],
        step: i64,
        alpha: f64,
        mixing: Mixing,
    ) -> Tensor {
        let inject_index = match mixing {
            Mixing::Crossover if styles.len() > 1 => crossover_points(step, styles.len() - 1),
            _ => Vec::new(),
        };
        let mut crossover = 0;
        let mut out = noise[0].shallow_clone();
        for (i, (block, to_rgb)) in self.progression.iter().zip(&self.to_rgb).enumerate() {
            let index = i as i64;
            let style = match mixing {
                Mixing::Range(lo, hi) if lo <= index && index <= hi => &styles[styles.len() - 1],
                Mixing::Range(..) => &styles[0],
                Mixing::Crossover => {
                    if crossover < inject_index.len() && index > inject_index[crossover] {
                        crossover += 1;
                    }
                    &styles[crossover.min(styles.len() - 1)]
                }
            };
            let next = block.forward(&out, style, &noise[i]);
            if index == step {
                let rgb = next.apply(to_rgb);
                if i > 0 && (0. ..1.).contains(&alpha) {
                    let skip = upsample_nearest(&out.apply(&self.to_rgb[i - 1]));
                    return skip * (1. - alpha) + rgb * alpha;
                }
                return rgb;
            }
            out = next;
        }
        out
    }
}

/// Mapping network plus synthesis network. Variable names follow the
/// `StyledGenerator` state dict, e.g. `generator.progression.5.conv1.0.weight`.
#[derive(Debug)]
pub struct StyledGenerator {
    generator: Generator,
    style: nn::Sequential,
}

impl StyledGenerator {
    pub fn new(root: &nn::Path) -> Self {
        let style_path = root / "style";
        let mut style = nn::seq().add_fn(pixel_norm);
        for i in 0..N_MLP {
            style = style
                .add(equal_linear(&(&style_path / (2 * i + 1)), LATENT_DIM, LATENT_DIM))
                .add_fn(leaky_relu(0.2));
        }
        Self {
            generator: Generator::new(&(root / "generator")),
            style,
        }
    }
}

impl Synthesizer for StyledGenerator {
    fn mean_style(&self, latent: &Tensor) -> Tensor {
        latent.apply(&self.style).mean_dim(&[0], true, Kind::Float)
    }

    fn synthesize(&self, latents: &[Tensor], options: &SynthesisOptions) -> Tensor {
        let styles = latents
            .iter()
            .map(|latent| {
                let style = latent.apply(&self.style);
                match options.mean_style {
                    Some(mean) => mean + (style - mean) * options.style_weight,
                    None => style,
                }
            })
            .collect::<Vec<_>>();
        let batch = latents[0].size()[0];
        let device = latents[0].device();
        let noise = (0..=options.step)
            .map(|i| {
                let size = 4 << i;
                Tensor::randn(&[batch, 1, size, size], (Kind::Float, device))
            })
            .collect::<Vec<_>>();
        self.generator
            .forward(&styles, &noise, options.step, options.alpha, options.mixing)
    }
}

pub fn rand_latent(batch_size: i64, device: Device) -> Tensor {
    Tensor::randn(&[batch_size, LATENT_DIM], (Kind::Float, device))
}
