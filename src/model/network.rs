//! FN-SSL localization network: fusion blocks + IPD head (+ DOA head).
//!
//! ## Architecture
//!
//! ```text
//! Input: [B, C=4, F=256, T]
//! permute            → [B, T, F, C]
//! block_1 (First)    → [B, T, F, 256]
//! block_n (Chained)  → [B, T, F, 256]          (num_blocks > 1 only)
//! fold_freq          → [B·F, T, 256]
//! avg pool (12, T)   → [B·F, T/12, 256]        (remainder frames dropped)
//! emb2ipd + tanh     → [B·F, T/12, 2]
//! reshape / permute  → [B, T/12, F, 2]
//! cat(real, imag)    → [B, T/12, 2F]
//! ipd2doa (DOA only) → [B, T/12, 180]
//! ```
//!
//! ## Weight key paths
//!
//! ```text
//! block_{n}.fullLstm.*   block_{n}.narrLstm.*   (n starts at 1)
//! emb2ipd.{weight,bias}  — Linear(256, 2)
//! ipd2doa.{weight,bias}  — Linear(512, 180), DOA mode only
//! ```

use std::path::Path;

use candle_core::{DType, Device, Module, Tensor};
use candle_nn::VarBuilder;

use super::block::{BlockPosition, BlockSkips, FusionBlock, FusionBlockConfig};
use super::fold::fold_freq;
use crate::config::FnSslConfig;
use crate::{Error, Result};

/// The full localization network.
#[derive(Debug, Clone)]
pub struct LocalizationNetwork {
    blocks: Vec<FusionBlock>,
    emb2ipd: candle_nn::Linear,
    ipd2doa: Option<candle_nn::Linear>,
    cfg: FnSslConfig,
}

impl LocalizationNetwork {
    /// Build the network, creating or loading weights through `vb`.
    pub fn new(cfg: &FnSslConfig, vb: VarBuilder) -> Result<Self> {
        cfg.verify()?;

        let mut blocks = Vec::with_capacity(cfg.num_blocks);
        for i in 0..cfg.num_blocks {
            let (input_size, position) = if i == 0 {
                (cfg.input_size, BlockPosition::First)
            } else {
                (cfg.hidden_size, BlockPosition::Chained)
            };
            let block_cfg = FusionBlockConfig {
                input_size,
                hidden_size: cfg.hidden_size,
                dropout: cfg.dropout,
                causality: cfg.causality,
                position,
            };
            blocks.push(FusionBlock::new(&block_cfg, vb.pp(format!("block_{}", i + 1)))?);
        }

        let emb2ipd = candle_nn::linear(cfg.hidden_size, 2, vb.pp("emb2ipd"))?;
        let ipd2doa = if cfg.doa {
            Some(candle_nn::linear(
                2 * cfg.num_freqs,
                cfg.num_classes,
                vb.pp("ipd2doa"),
            )?)
        } else {
            None
        };

        tracing::info!(
            "FN-SSL network: {} block(s), hidden={}, {:?}, doa={}",
            cfg.num_blocks,
            cfg.hidden_size,
            cfg.causality,
            cfg.doa
        );

        Ok(Self {
            blocks,
            emb2ipd,
            ipd2doa,
            cfg: cfg.clone(),
        })
    }

    /// Load learned weights from a safetensors file.
    pub fn from_safetensors(path: &Path, cfg: &FnSslConfig, device: &Device) -> Result<Self> {
        tracing::info!("Loading FN-SSL weights from {:?}", path);
        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[path], DType::F32, device)
                .map_err(|e| Error::WeightLoad(format!("{}: {e}", path.display())))?
        };
        Self::new(cfg, vb).map_err(|e| match e {
            Error::Candle(e) => Error::WeightLoad(format!("{}: {e}", path.display())),
            other => other,
        })
    }

    pub fn config(&self) -> &FnSslConfig {
        &self.cfg
    }

    /// Forward pass.
    ///
    /// - `x`: `[B, C, F, T]` spectral features
    /// - `train`: apply dropout (use `false` for inference)
    ///
    /// Returns `[B, T / pool_window, 2F]` IPD features, or
    /// `[B, T / pool_window, num_classes]` logits in DOA mode.
    #[tracing::instrument(name = "fn_ssl_forward", skip_all)]
    pub fn forward(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let (b, c, f, t) = x.dims4()?;
        self.check_input(c, f, t)?;

        let mut xs = x.permute((0, 3, 2, 1))?;
        let mut skips: Option<BlockSkips> = None;
        for block in &self.blocks {
            let out = block.forward(&xs, skips.as_ref(), train)?;
            xs = out.output;
            skips = Some(out.skips);
        }

        let xs = fold_freq(&xs)?;
        let pooled = avg_pool_time(&xs, self.cfg.pool_window)?;
        let frames = pooled.dim(1)?;
        let ipd = self.emb2ipd.forward(&pooled)?.tanh()?;

        let ipd = ipd.reshape((b, f, frames, 2))?.permute((0, 2, 1, 3))?;
        let real = ipd.narrow(3, 0, 1)?.squeeze(3)?;
        let imag = ipd.narrow(3, 1, 1)?.squeeze(3)?;
        let result = Tensor::cat(&[&real, &imag], 2)?;

        let result = match &self.ipd2doa {
            Some(ipd2doa) => ipd2doa.forward(&result)?,
            None => result,
        };
        tracing::debug!("FN-SSL: [{b}, {c}, {f}, {t}] -> {:?}", result.dims());
        Ok(result)
    }

    fn check_input(&self, channels: usize, freqs: usize, frames: usize) -> Result<()> {
        if channels != self.cfg.input_size {
            return Err(Error::ShapeMismatch(format!(
                "expected {} input channels, got {channels}",
                self.cfg.input_size
            )));
        }
        // Only the DOA projection fixes the frequency count.
        if self.ipd2doa.is_some() && freqs != self.cfg.num_freqs {
            return Err(Error::ShapeMismatch(format!(
                "DOA head expects {} frequency bins, got {freqs}",
                self.cfg.num_freqs
            )));
        }
        if frames < self.cfg.pool_window {
            return Err(Error::ShapeMismatch(format!(
                "need at least {} frames for one pooling window, got {frames}",
                self.cfg.pool_window
            )));
        }
        Ok(())
    }
}

/// Average over non-overlapping windows along axis 1 of `[N, T, D]`.
///
/// Trailing frames that do not fill a window are dropped.
pub fn avg_pool_time(x: &Tensor, window: usize) -> Result<Tensor> {
    let (n, t, d) = x.dims3()?;
    let frames = t / window;
    if frames == 0 {
        return Err(Error::ShapeMismatch(format!(
            "pooling window {window} is longer than {t} frames"
        )));
    }
    Ok(x.narrow(1, 0, frames * window)?
        .reshape((n, frames, window, d))?
        .mean(2)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Causality;
    use candle_core::IndexOp;
    use candle_nn::VarMap;

    fn make_vb(device: &Device) -> (VarMap, VarBuilder<'static>) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        (varmap, vb)
    }

    fn small_config() -> FnSslConfig {
        FnSslConfig {
            hidden_size: 8,
            num_freqs: 5,
            pool_window: 4,
            num_classes: 7,
            ..FnSslConfig::default()
        }
    }

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
        (a - b)
            .unwrap()
            .abs()
            .unwrap()
            .flatten_all()
            .unwrap()
            .max(0)
            .unwrap()
            .to_scalar()
            .unwrap()
    }

    fn parameter_total(varmap: &VarMap) -> usize {
        varmap.all_vars().iter().map(|v| v.elem_count()).sum()
    }

    #[test]
    fn avg_pool_truncates_remainder() {
        let device = Device::Cpu;
        let x = Tensor::arange(0f32, 10.0, &device)
            .unwrap()
            .reshape((1, 10, 1))
            .unwrap();
        let pooled = avg_pool_time(&x, 4).unwrap();
        assert_eq!(pooled.dims(), &[1, 2, 1]);
        let values: Vec<f32> = pooled.flatten_all().unwrap().to_vec1().unwrap();
        // mean(0..4) = 1.5, mean(4..8) = 5.5; frames 8 and 9 are dropped.
        assert_eq!(values, vec![1.5, 5.5]);
    }

    #[test]
    fn avg_pool_rejects_short_input() {
        let device = Device::Cpu;
        let x = Tensor::zeros((2, 3, 4), DType::F32, &device).unwrap();
        assert!(matches!(avg_pool_time(&x, 4), Err(Error::ShapeMismatch(_))));
    }

    #[test]
    fn ipd_output_shape() {
        let device = Device::Cpu;
        let (_varmap, vb) = make_vb(&device);
        let cfg = small_config();
        let net = LocalizationNetwork::new(&cfg, vb).unwrap();

        // 18 frames / window 4 = 4 pooled frames (2 dropped).
        let x = Tensor::randn(0f32, 1.0, (2, 4, 5, 18), &device).unwrap();
        let out = net.forward(&x, false).unwrap();
        assert_eq!(out.dims(), &[2, cfg.output_frames(18), cfg.output_width()]);
        assert_eq!(out.dims(), &[2, 4, 10]);
    }

    #[test]
    fn ipd_features_are_bounded() {
        let device = Device::Cpu;
        let (_varmap, vb) = make_vb(&device);
        let net = LocalizationNetwork::new(&small_config(), vb).unwrap();
        let x = (Tensor::randn(0f32, 1.0, (1, 4, 5, 8), &device).unwrap() * 10.0).unwrap();
        let out = net.forward(&x, false).unwrap();
        let peak: f32 = out
            .abs()
            .unwrap()
            .flatten_all()
            .unwrap()
            .max(0)
            .unwrap()
            .to_scalar()
            .unwrap();
        assert!(peak <= 1.0);
    }

    #[test]
    fn real_and_imag_halves_come_from_ipd_pair() {
        let device = Device::Cpu;
        let (_varmap, vb) = make_vb(&device);
        let cfg = small_config();
        let net = LocalizationNetwork::new(&cfg, vb).unwrap();
        let x = Tensor::randn(0f32, 1.0, (1, 4, 5, 8), &device).unwrap();
        let out = net.forward(&x, false).unwrap();

        // Rebuild the IPD pair for frequency bin 3 by hand.
        let mut xs = x.permute((0, 3, 2, 1)).unwrap();
        let mut skips: Option<BlockSkips> = None;
        for block in &net.blocks {
            let o = block.forward(&xs, skips.as_ref(), false).unwrap();
            xs = o.output;
            skips = Some(o.skips);
        }
        let pooled = avg_pool_time(&fold_freq(&xs).unwrap(), 4).unwrap();
        let ipd = net.emb2ipd.forward(&pooled).unwrap().tanh().unwrap();
        let bin3 = ipd.i(3).unwrap(); // [frames, 2]

        let real = out.i((0, .., 3)).unwrap();
        let imag = out.i((0, .., 5 + 3)).unwrap();
        assert!(max_abs_diff(&real, &bin3.i((.., 0)).unwrap()) < 1e-6);
        assert!(max_abs_diff(&imag, &bin3.i((.., 1)).unwrap()) < 1e-6);
    }

    #[test]
    fn doa_output_shape() {
        let device = Device::Cpu;
        let (_varmap, vb) = make_vb(&device);
        let cfg = FnSslConfig {
            doa: true,
            ..small_config()
        };
        let net = LocalizationNetwork::new(&cfg, vb).unwrap();
        let x = Tensor::randn(0f32, 1.0, (3, 4, 5, 9), &device).unwrap();
        let out = net.forward(&x, false).unwrap();
        assert_eq!(out.dims(), &[3, 2, 7]);
    }

    #[test]
    fn reference_scenario_shapes() {
        // Full input geometry with a narrow hidden width to keep the test fast.
        let device = Device::Cpu;
        let x = Tensor::randn(0f32, 1.0, (2, 4, 256, 298), &device).unwrap();

        let (_varmap, vb) = make_vb(&device);
        let cfg = FnSslConfig {
            hidden_size: 4,
            ..FnSslConfig::default()
        };
        let net = LocalizationNetwork::new(&cfg, vb).unwrap();
        assert_eq!(net.forward(&x, false).unwrap().dims(), &[2, 24, 512]);

        let (_varmap, vb) = make_vb(&device);
        let cfg = FnSslConfig {
            doa: true,
            ..cfg
        };
        let net = LocalizationNetwork::new(&cfg, vb).unwrap();
        assert_eq!(net.forward(&x, false).unwrap().dims(), &[2, 24, 180]);
    }

    #[test]
    fn eval_mode_is_deterministic() {
        let device = Device::Cpu;
        let (_varmap, vb) = make_vb(&device);
        let net = LocalizationNetwork::new(&small_config(), vb).unwrap();
        let x = Tensor::randn(0f32, 1.0, (2, 4, 5, 12), &device).unwrap();
        let a = net.forward(&x, false).unwrap();
        let b = net.forward(&x, false).unwrap();
        assert_eq!(max_abs_diff(&a, &b), 0.0);
    }

    #[test]
    fn train_mode_applies_dropout() {
        let device = Device::Cpu;
        let (_varmap, vb) = make_vb(&device);
        let net = LocalizationNetwork::new(&small_config(), vb).unwrap();
        let x = Tensor::randn(0f32, 1.0, (2, 4, 5, 12), &device).unwrap();
        let eval = net.forward(&x, false).unwrap();
        let train = net.forward(&x, true).unwrap();
        assert_eq!(train.dims(), eval.dims());
        assert!(max_abs_diff(&eval, &train) > 0.0);
    }

    #[test]
    fn batch_items_are_independent() {
        let device = Device::Cpu;
        let (_varmap, vb) = make_vb(&device);
        let net = LocalizationNetwork::new(&small_config(), vb).unwrap();
        let x = Tensor::randn(0f32, 1.0, (3, 4, 5, 8), &device).unwrap();
        let batched = net.forward(&x, false).unwrap();

        let singles: Vec<Tensor> = (0..3)
            .map(|i| net.forward(&x.narrow(0, i, 1).unwrap(), false).unwrap())
            .collect();
        let stacked = Tensor::cat(&singles, 0).unwrap();
        assert!(max_abs_diff(&batched, &stacked) < 1e-5);
    }

    #[test]
    fn batch_permutation_permutes_output() {
        let device = Device::Cpu;
        let (_varmap, vb) = make_vb(&device);
        let net = LocalizationNetwork::new(&small_config(), vb).unwrap();
        let x = Tensor::randn(0f32, 1.0, (2, 4, 5, 8), &device).unwrap();
        let swapped = Tensor::cat(&[&x.i(1..2).unwrap(), &x.i(0..1).unwrap()], 0).unwrap();

        let out = net.forward(&x, false).unwrap();
        let out_swapped = net.forward(&swapped, false).unwrap();
        assert!(max_abs_diff(&out.i(0).unwrap(), &out_swapped.i(1).unwrap()) < 1e-5);
        assert!(max_abs_diff(&out.i(1).unwrap(), &out_swapped.i(0).unwrap()) < 1e-5);
    }

    /// Perturb frames `8..` of a `[1, 4, 5, 16]` input and return the
    /// largest change in the first two pooled frames (input frames `0..8`)
    /// and in the last two.
    fn future_sensitivity(causality: Causality) -> (f32, f32) {
        let device = Device::Cpu;
        let (_varmap, vb) = make_vb(&device);
        let cfg = FnSslConfig {
            causality,
            ..small_config()
        };
        let net = LocalizationNetwork::new(&cfg, vb).unwrap();

        let x = Tensor::randn(0f32, 1.0, (1, 4, 5, 16), &device).unwrap();
        let future = Tensor::randn(0f32, 1.0, (1, 4, 5, 8), &device).unwrap();
        let y = Tensor::cat(&[&x.narrow(3, 0, 8).unwrap(), &future], 3).unwrap();

        let out_x = net.forward(&x, false).unwrap();
        let out_y = net.forward(&y, false).unwrap();
        let past = max_abs_diff(&out_x.i((.., ..2)).unwrap(), &out_y.i((.., ..2)).unwrap());
        let later = max_abs_diff(&out_x.i((.., 2..)).unwrap(), &out_y.i((.., 2..)).unwrap());
        (past, later)
    }

    #[test]
    fn online_mode_is_causal_in_time() {
        let (past, later) = future_sensitivity(Causality::Online);
        assert!(past < 1e-6, "online output changed before the perturbation: {past}");
        assert!(later > 1e-6);
    }

    #[test]
    fn offline_mode_looks_ahead() {
        let (past, _) = future_sensitivity(Causality::Offline);
        assert!(past > 1e-6, "offline output should depend on future frames");
    }

    #[test]
    fn parameter_count_matches_created_tensors() {
        let device = Device::Cpu;
        for causality in [Causality::Offline, Causality::Online] {
            for doa in [false, true] {
                let cfg = FnSslConfig {
                    causality,
                    doa,
                    num_blocks: 2,
                    ..small_config()
                };
                let (varmap, vb) = make_vb(&device);
                LocalizationNetwork::new(&cfg, vb).unwrap();
                assert_eq!(parameter_total(&varmap), cfg.parameter_count());
            }
        }
    }

    #[test]
    fn multi_block_stack_keeps_shape() {
        let device = Device::Cpu;
        let (varmap, vb) = make_vb(&device);
        let cfg = FnSslConfig {
            num_blocks: 3,
            ..small_config()
        };
        let net = LocalizationNetwork::new(&cfg, vb).unwrap();
        let x = Tensor::randn(0f32, 1.0, (1, 4, 5, 8), &device).unwrap();
        assert_eq!(net.forward(&x, false).unwrap().dims(), &[1, 2, 10]);
        let data = varmap.data().lock().unwrap();
        assert!(data.contains_key("block_3.narrLstm.weight_ih_l0"));
        // Chained blocks read the hidden width, not the raw channels.
        assert_eq!(data["block_2.fullLstm.weight_ih_l0"].dims(), &[16, 8]);
    }

    #[test]
    fn wrong_input_geometry_rejected() {
        let device = Device::Cpu;
        let (_varmap, vb) = make_vb(&device);
        let net = LocalizationNetwork::new(&small_config(), vb).unwrap();

        let wrong_channels = Tensor::zeros((1, 3, 5, 8), DType::F32, &device).unwrap();
        let too_short = Tensor::zeros((1, 4, 5, 3), DType::F32, &device).unwrap();
        for x in [wrong_channels, too_short] {
            assert!(matches!(net.forward(&x, false), Err(Error::ShapeMismatch(_))));
        }

        let (_varmap, vb) = make_vb(&device);
        let cfg = FnSslConfig {
            doa: true,
            ..small_config()
        };
        let doa_net = LocalizationNetwork::new(&cfg, vb).unwrap();
        let wrong_freqs = Tensor::zeros((1, 4, 6, 8), DType::F32, &device).unwrap();
        assert!(matches!(
            doa_net.forward(&wrong_freqs, false),
            Err(Error::ShapeMismatch(_))
        ));
    }

    #[test]
    fn ipd_mode_accepts_any_frequency_count() {
        let device = Device::Cpu;
        let (_varmap, vb) = make_vb(&device);
        let cfg = FnSslConfig {
            hidden_size: 8,
            ..FnSslConfig::default()
        };
        let net = LocalizationNetwork::new(&cfg, vb).unwrap();
        assert_eq!(net.config().num_freqs, 256);

        let x = Tensor::randn(0f32, 1.0, (1, 4, 129, 24), &device).unwrap();
        let out = net.forward(&x, false).unwrap();
        assert_eq!(out.dims(), &[1, 2, 258]);
    }

    #[test]
    fn invalid_config_rejected_at_construction() {
        let device = Device::Cpu;
        let (_varmap, vb) = make_vb(&device);
        let cfg = FnSslConfig {
            hidden_size: 7,
            ..small_config()
        };
        assert!(matches!(LocalizationNetwork::new(&cfg, vb), Err(Error::Config(_))));
    }

    #[test]
    fn network_is_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<LocalizationNetwork>();
    }

    #[test]
    fn safetensors_roundtrip() {
        let device = Device::Cpu;
        let cfg = small_config();
        let (varmap, vb) = make_vb(&device);
        let net = LocalizationNetwork::new(&cfg, vb).unwrap();

        let path = std::env::temp_dir()
            .join(format!("fn-ssl-test-{}.safetensors", std::process::id()));
        varmap.save(&path).unwrap();
        let loaded = LocalizationNetwork::from_safetensors(&path, &cfg, &device).unwrap();
        std::fs::remove_file(&path).ok();

        let x = Tensor::randn(0f32, 1.0, (1, 4, 5, 8), &device).unwrap();
        let a = net.forward(&x, false).unwrap();
        let b = loaded.forward(&x, false).unwrap();
        assert!(max_abs_diff(&a, &b) < 1e-6);
    }

    #[test]
    fn missing_weights_are_a_load_error() {
        let device = Device::Cpu;
        let small = small_config();
        let (varmap, vb) = make_vb(&device);
        LocalizationNetwork::new(&small, vb).unwrap();

        let path = std::env::temp_dir()
            .join(format!("fn-ssl-test-doa-{}.safetensors", std::process::id()));
        varmap.save(&path).unwrap();
        // The file has no ipd2doa weights.
        let cfg = FnSslConfig { doa: true, ..small };
        let err = LocalizationNetwork::from_safetensors(&path, &cfg, &device).unwrap_err();
        std::fs::remove_file(&path).ok();
        assert!(matches!(err, Error::WeightLoad(_)));
    }
}
