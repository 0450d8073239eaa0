//! Convolutional metric engine on libtorch (cargo feature `tch`).

use crate::minibatch::MiniBatch;
use crate::trainer::engine::{ConvergenceTracker, EngineConfig, ModelUpdateEngine, StepReport};
use crate::trainer::state::{ModelState, NamedTensor};
use crate::transforms::vision::stack_images;
use anyhow::{bail, ensure, Context, Result};
use tch::nn::{self, Module, OptimizerConfig};
use tch::{Device, Kind, Tensor};

pub const TCH_ENGINE_KIND: &str = "tch-conv-metric";

/// conv(5x5, s2) → relu → conv(3x3, s2) → relu → global avg pool → linear.
#[derive(Debug)]
struct EmbeddingNet {
    conv1: nn::Conv2D,
    conv2: nn::Conv2D,
    fc: nn::Linear,
}

impl EmbeddingNet {
    fn new(root: &nn::Path, embedding_dim: i64) -> Self {
        let stride2 = nn::ConvConfig {
            stride: 2,
            ..Default::default()
        };
        Self {
            conv1: nn::conv2d(root / "conv1", 3, 16, 5, stride2),
            conv2: nn::conv2d(root / "conv2", 16, 32, 3, stride2),
            fc: nn::linear(root / "fc", 32, embedding_dim, Default::default()),
        }
    }
}

impl Module for EmbeddingNet {
    fn forward(&self, xs: &Tensor) -> Tensor {
        xs.apply(&self.conv1)
            .relu()
            .apply(&self.conv2)
            .relu()
            .adaptive_avg_pool2d([1, 1])
            .flatten(1, -1)
            .apply(&self.fc)
    }
}

pub struct TchMetricEngine {
    config: EngineConfig,
    vs: nn::VarStore,
    net: EmbeddingNet,
    optimizer: nn::Optimizer,
    tracker: ConvergenceTracker,
    steps: u64,
}

impl TchMetricEngine {
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        tch::manual_seed(config.seed as i64);
        let device = Device::cuda_if_available();
        let vs = nn::VarStore::new(device);
        let net = EmbeddingNet::new(&vs.root(), config.embedding_dim as i64);
        let optimizer = nn::Sgd {
            momentum: config.momentum,
            dampening: 0.0,
            wd: config.weight_decay,
            nesterov: false,
        }
        .build(&vs, config.learning_rate)
        .context("Failed to build SGD optimizer")?;

        Ok(Self {
            config,
            vs,
            net,
            optimizer,
            tracker: ConvergenceTracker::from_config(&config),
            steps: 0,
        })
    }

    /// Loads weights from a snapshot. Optimizer momentum is not restored.
    pub fn from_state(config: EngineConfig, state: &ModelState) -> Result<Self> {
        if state.kind != TCH_ENGINE_KIND {
            bail!("cannot resume a {TCH_ENGINE_KIND} engine from a {} state", state.kind);
        }
        let mut engine = Self::new(config)?;
        let variables = engine.vs.variables();
        tch::no_grad(|| -> Result<()> {
            for (name, mut var) in variables {
                let param = state
                    .param(&name)
                    .with_context(|| format!("model state has no {name} tensor"))?;
                let shape: Vec<i64> = param.shape.iter().map(|&d| d as i64).collect();
                ensure!(
                    var.size() == shape,
                    "{name} has shape {:?}, this engine expects {:?}",
                    shape,
                    var.size()
                );
                let value = Tensor::from_slice(&param.data)
                    .reshape(&shape)
                    .to_device(var.device());
                var.f_copy_(&value)?;
            }
            Ok(())
        })?;
        engine.steps = state.steps;
        engine.tracker.set_learning_rate(state.learning_rate);
        engine.optimizer.set_lr(state.learning_rate);
        Ok(engine)
    }

    fn metric_loss(&self, embeddings: &Tensor, labels: &[usize]) -> Tensor {
        let device = embeddings.device();
        let n = labels.len() as i64;
        let labels: Vec<i64> = labels.iter().map(|&l| l as i64).collect();
        let labels = Tensor::from_slice(&labels).to_device(device);

        let diff = embeddings.unsqueeze(1) - embeddings.unsqueeze(0);
        let dist = (diff.square().sum_dim_intlist(-1, false, Kind::Float) + 1e-12).sqrt();

        let upper = Tensor::ones([n, n], (Kind::Bool, device)).triu(1);
        let same = labels.unsqueeze(1).eq_tensor(&labels.unsqueeze(0));
        let positive = same.logical_and(&upper).to_kind(Kind::Float);
        let negative = same.logical_not().logical_and(&upper).to_kind(Kind::Float);

        let t = self.config.distance_threshold;
        let m = self.config.margin;
        let pos_loss = ((&dist - (t - m)).relu() * &positive).sum(Kind::Float)
            / positive.sum(Kind::Float).clamp_min(1.0);
        let neg_loss = (((t + m) - &dist).relu() * &negative).sum(Kind::Float)
            / negative.sum(Kind::Float).clamp_min(1.0);
        pos_loss + neg_loss
    }
}

impl ModelUpdateEngine for TchMetricEngine {
    fn step(&mut self, batch: &MiniBatch) -> Result<StepReport> {
        let images = stack_images(batch.images())?.to_device(self.vs.device());
        let embeddings = self.net.forward(&images);
        let loss = self.metric_loss(&embeddings, batch.labels());
        let loss_value = loss.double_value(&[]);
        ensure!(
            loss_value.is_finite(),
            "loss diverged to {loss_value} at step {}",
            self.steps
        );

        self.optimizer.backward_step(&loss);
        self.steps += 1;
        let learning_rate = self.tracker.observe(loss_value);
        self.optimizer.set_lr(learning_rate);
        Ok(StepReport {
            learning_rate,
            loss: loss_value,
        })
    }

    fn snapshot(&self) -> Result<ModelState> {
        let mut state = ModelState::new(TCH_ENGINE_KIND, self.steps, self.tracker.learning_rate())
            .with_metadata("embedding_dim", self.config.embedding_dim);
        let mut variables: Vec<_> = self.vs.variables().into_iter().collect();
        variables.sort_by(|a, b| a.0.cmp(&b.0));
        for (name, var) in variables {
            let shape = var.size().iter().map(|&d| d as usize).collect();
            let data = Vec::<f32>::try_from(var.to_device(Device::Cpu).to_kind(Kind::Float).flatten(0, -1))
                .with_context(|| format!("Failed to copy {name} to host"))?;
            state = state.with_param(NamedTensor::new(name, shape, data)?);
        }
        Ok(state)
    }

    fn finalize(self) -> Result<ModelState> {
        self.snapshot()
    }

    fn learning_rate(&self) -> f64 {
        self.tracker.learning_rate()
    }

    fn steps(&self) -> u64 {
        self.steps
    }
}
