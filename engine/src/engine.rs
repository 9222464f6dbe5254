use std::sync::Arc;

use distributed::{Context, Group, ReduceOp};
use log::{debug, warn};
use machine_learning::{
    MlErr,
    arch::{Model, loss::LossFn},
    optimization::Optimizer,
};
use ndarray::{Array2, ArrayView2};
use rayon::prelude::*;

use crate::{Result, UsageErr, amp::Precision, amp::clip_grad_norm};

/// Where the engine stands within a training step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    ZeroGrad,
    Forward,
    Backward,
}

/// The output of a forward pass, tagged with the pass that produced it.
#[derive(Debug, Clone)]
pub struct Output {
    forward: u64,
    value: Array2<f32>,
}

impl Output {
    pub fn value(&self) -> ArrayView2<'_, f32> {
        self.value.view()
    }

    pub fn into_inner(self) -> Array2<f32> {
        self.value
    }

    /// The id of the forward pass that produced this output.
    pub fn forward_id(&self) -> u64 {
        self.forward
    }
}

/// A scalar loss and, unless detached, its gradient with respect to a forward output.
#[derive(Debug, Clone)]
pub struct Loss {
    value: f32,
    graph: Option<(u64, Array2<f32>)>,
}

impl Loss {
    /// A loss not connected to any forward pass, it back-propagates zero gradients.
    pub fn detached(value: f32) -> Self {
        Self { value, graph: None }
    }

    pub fn item(&self) -> f32 {
        self.value
    }

    pub fn is_detached(&self) -> bool {
        self.graph.is_none()
    }
}

/// The outcome of `Engine::step`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepReport {
    /// The gradients overflowed and the parameters were left untouched.
    pub skipped: bool,
    /// The loss scale for the next step.
    pub loss_scale: f32,
    /// The gradient norm before clipping, `None` for skipped steps.
    pub grad_norm: Option<f32>,
}

/// Drives the training of a data parallel replica of a model.
///
/// Every training step follows `zero_grad`, `forward`, `criterion`, `backward` and `step`.
/// Gradients are averaged across the data parallel group during `backward`, so every
/// replica applies the same update.
pub struct Engine<M, O, L> {
    ctx: Arc<Context>,
    model: M,
    optimizer: O,
    criterion: L,
    /// f32 weights the optimizer updates.
    master: Vec<f32>,
    /// Weights the model runs on.
    working: Vec<f32>,
    grad: Vec<f32>,
    micro_grad: Vec<f32>,
    precision: Precision,
    data_group: Group,
    model_group: Group,
    phase: Phase,
    training: bool,
    forward_id: u64,
    /// The forward pass whose activations are still cached in the model.
    live_forward: Option<u64>,
    steps: u64,
    overflows: u64,
}

impl<M, O, L> Engine<M, O, L>
where
    M: Model,
    O: Optimizer,
    L: LossFn,
{
    /// Creates a new `Engine`, see `initialize` for the checks done beforehand.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        ctx: Arc<Context>,
        mut model: M,
        params: Vec<f32>,
        optimizer: O,
        criterion: L,
        precision: Precision,
        data_group: Group,
        model_group: Group,
    ) -> Self {
        let size = params.len();
        let mut working = vec![0.; size];
        precision.cast_params(&params, &mut working);
        model.set_training(true);

        Self {
            ctx,
            model,
            optimizer,
            criterion,
            master: params,
            working,
            grad: vec![0.; size],
            micro_grad: vec![0.; size],
            precision,
            data_group,
            model_group,
            phase: Phase::Idle,
            training: true,
            forward_id: 0,
            live_forward: None,
            steps: 0,
            overflows: 0,
        }
    }

    /// Puts the model in training mode.
    pub fn train(&mut self) {
        self.training = true;
        self.model.set_training(true);
    }

    /// Puts the model in evaluation mode, disabling dropout.
    pub fn eval(&mut self) {
        self.training = false;
        self.model.set_training(false);
    }

    pub fn is_training(&self) -> bool {
        self.training
    }

    /// Clears the accumulated gradients, starting a new training step.
    pub fn zero_grad(&mut self) {
        self.grad.fill(0.);
        self.phase = Phase::ZeroGrad;
    }

    /// Runs the model on a batch of inputs.
    ///
    /// In training mode it must come after `zero_grad`. Only the activations of the latest
    /// forward pass are kept for `backward`.
    ///
    /// # Arguments
    /// * `x` - The inputs, one sample per row.
    ///
    /// # Returns
    /// The model's output.
    pub fn forward(&mut self, x: ArrayView2<f32>) -> Result<Output> {
        if self.training && self.phase == Phase::Idle {
            return Err(UsageErr::MissingZeroGrad.into());
        }

        let x = self.precision.cast_input(x);
        let value = self.model.forward(&self.working, x.view())?;
        self.forward_id += 1;

        if self.training {
            self.phase = Phase::Forward;
            self.live_forward = Some(self.forward_id);
        } else {
            self.live_forward = None;
        }

        Ok(Output {
            forward: self.forward_id,
            value,
        })
    }

    /// Computes the loss of an output against its targets.
    pub fn criterion(&self, output: &Output, labels: ArrayView2<f32>) -> Result<Loss> {
        if labels.dim() != output.value.dim() {
            return Err(MlErr::SizeMismatch {
                what: "labels",
                got: labels.len(),
                expected: output.value.len(),
            }
            .into());
        }

        let y_pred = output.value.view();
        let value = self.criterion.loss(y_pred, labels);
        let grad = self.criterion.loss_prime(y_pred, labels);

        Ok(Loss {
            value,
            graph: Some((output.forward, grad)),
        })
    }

    /// Back-propagates the scaled loss and accumulates the data parallel average of the
    /// resulting gradients.
    ///
    /// A detached loss contributes zero gradients but still joins the averaging, so that
    /// every replica runs the same collectives.
    pub async fn backward(&mut self, loss: &Loss) -> Result<()> {
        if !self.training {
            return Err(UsageErr::NotTraining.into());
        }

        if self.phase == Phase::Idle {
            return Err(UsageErr::MissingZeroGrad.into());
        }

        self.ensure_alive().await?;

        match &loss.graph {
            None => self.micro_grad.fill(0.),
            Some((forward, grad)) => {
                if *forward != self.forward_id {
                    return Err(UsageErr::StaleForward {
                        forward: *forward,
                        latest: self.forward_id,
                    }
                    .into());
                }

                if self.live_forward != Some(*forward) {
                    return Err(UsageErr::BackwardWithoutForward.into());
                }

                let d = grad * self.precision.loss_scale();
                self.model.backward(&self.working, &mut self.micro_grad, d)?;
                self.live_forward = None;
                self.precision.store_grads(&mut self.micro_grad);
            }
        }

        if self.data_group.size() > 1 {
            self.ctx
                .all_reduce(&self.data_group, &mut self.micro_grad, ReduceOp::Avg)
                .await?;
        }

        self.grad
            .par_iter_mut()
            .zip(&self.micro_grad)
            .for_each(|(g, m)| *g += m);

        self.phase = Phase::Backward;
        Ok(())
    }

    /// Applies the accumulated gradients, unless they overflowed.
    ///
    /// An overflowing step leaves every parameter untouched and only shrinks the loss
    /// scale. The decision is shared by the whole model parallel group.
    pub async fn step(&mut self) -> Result<StepReport> {
        if self.phase != Phase::Backward {
            return Err(UsageErr::StepWithoutBackward.into());
        }

        self.ensure_alive().await?;

        let mut overflow = self.precision.unscale_and_check(&mut self.grad);

        if self.model_group.size() > 1 {
            let mut flag = [if overflow { 1. } else { 0. }];
            self.ctx
                .all_reduce(&self.model_group, &mut flag, ReduceOp::Max)
                .await?;
            overflow = flag[0] > 0.;
        }

        let grad_norm = if overflow {
            self.overflows += 1;
            warn!(
                step = self.steps, loss_scale = self.precision.loss_scale();
                "gradient overflow, skipping step"
            );
            None
        } else {
            let norm = clip_grad_norm(&mut self.grad, self.precision.clip());
            self.optimizer.update_params(&mut self.master, &self.grad)?;
            self.precision.cast_params(&self.master, &mut self.working);
            Some(norm)
        };

        self.precision.update(overflow);
        self.steps += 1;
        self.phase = Phase::Idle;

        let loss_scale = self.precision.loss_scale();
        debug!(step = self.steps, loss_scale = loss_scale; "step done");

        Ok(StepReport {
            skipped: overflow,
            loss_scale,
            grad_norm,
        })
    }

    async fn ensure_alive(&self) -> Result<()> {
        if self.ctx.is_destroyed().await {
            return Err(UsageErr::Destroyed.into());
        }

        Ok(())
    }

    /// The f32 master weights.
    pub fn params(&self) -> &[f32] {
        &self.master
    }

    /// The accumulated gradients. After a step they are unscaled and clipped.
    pub fn grads(&self) -> &[f32] {
        &self.grad
    }

    pub fn loss_scale(&self) -> f32 {
        self.precision.loss_scale()
    }

    pub fn precision(&self) -> &Precision {
        &self.precision
    }

    /// The amount of skipped steps.
    pub fn overflow_count(&self) -> u64 {
        self.overflows
    }

    /// The amount of `step` calls, skipped ones included.
    pub fn steps(&self) -> u64 {
        self.steps
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.ctx
    }
}
