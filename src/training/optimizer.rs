/// SGD with momentum over named parameter groups
///
/// Follows the classic formulation with coupled L2 weight decay:
/// `d = grad + wd * p`, `buf = momentum * buf + d`, `p = p - lr * buf`.
use candle_core::{backprop::GradStore, Result, Tensor, Var};
use std::collections::{HashMap, HashSet};

use crate::layers::Parameter;
use crate::models::Fcn32s;
use super::partition::{get_parameters, ParamKind};

/// SGD configuration
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct SgdConfig {
    /// Base learning rate (weight group)
    pub lr: f64,
    /// Momentum factor shared by all groups
    pub momentum: f64,
    /// L2 penalty of the weight group
    pub weight_decay: f64,
}

impl Default for SgdConfig {
    fn default() -> Self {
        Self {
            lr: 1.0e-10,
            momentum: 0.99,
            weight_decay: 0.0005,
        }
    }
}

/// Parameters sharing one learning rate and weight decay
#[derive(Debug, Clone)]
pub struct ParamGroup {
    pub params: Vec<Parameter>,
    pub lr: f64,
    pub weight_decay: f64,
}

/// Serializable hyperparameters of one group
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct GroupState {
    pub lr: f64,
    pub weight_decay: f64,
    /// Parameter names, in group order
    pub params: Vec<String>,
}

/// Serializable optimizer hyperparameters; momentum buffers travel separately
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct SgdState {
    pub momentum: f64,
    pub groups: Vec<GroupState>,
}

/// SGD optimizer
pub struct Sgd {
    momentum: f64,
    groups: Vec<ParamGroup>,
    /// Momentum buffers by parameter name, created on first update
    buffers: HashMap<String, Var>,
}

impl Sgd {
    /// Create new optimizer; a parameter may belong to one group only.
    pub fn new(groups: Vec<ParamGroup>, momentum: f64) -> crate::Result<Self> {
        let mut seen = HashSet::new();
        for param in groups.iter().flat_map(|g| g.params.iter()) {
            if !seen.insert(param.name.as_str()) {
                return Err(crate::FcnError::Config(format!(
                    "parameter {} appears in more than one group",
                    param.name
                )));
            }
        }

        Ok(Self {
            momentum,
            groups,
            buffers: HashMap::new(),
        })
    }

    /// Two groups for FCN training: weights at `lr` with weight decay, biases at
    /// `2 * lr` without weight decay.
    pub fn for_fcn(model: &Fcn32s, config: &SgdConfig) -> crate::Result<Self> {
        let weights = get_parameters(model, ParamKind::Weights)?;
        let biases = get_parameters(model, ParamKind::Biases)?;

        log::info!(
            "Optimizer groups: {} weights (lr={:e}, wd={}), {} biases (lr={:e}, wd=0)",
            weights.len(),
            config.lr,
            config.weight_decay,
            biases.len(),
            config.lr * 2.0
        );

        Self::new(
            vec![
                ParamGroup {
                    params: weights,
                    lr: config.lr,
                    weight_decay: config.weight_decay,
                },
                ParamGroup {
                    params: biases,
                    lr: config.lr * 2.0,
                    weight_decay: 0.0,
                },
            ],
            config.momentum,
        )
    }

    /// Perform a single optimization step
    ///
    /// Parameters without a gradient in `grads` are left untouched.
    pub fn step(&mut self, grads: &GradStore) -> Result<()> {
        for group in &self.groups {
            for param in &group.params {
                let grad = match grads.get(param.tensor()) {
                    Some(grad) => grad,
                    None => continue,
                };

                let mut d_p = grad.clone();
                if group.weight_decay != 0.0 {
                    d_p = (d_p + (param.tensor() * group.weight_decay)?)?;
                }

                if self.momentum != 0.0 {
                    d_p = match self.buffers.get(&param.name) {
                        Some(buf) => {
                            let next = ((buf.as_tensor() * self.momentum)? + d_p)?;
                            buf.set(&next)?;
                            buf.as_tensor().clone()
                        }
                        None => {
                            let buf = Var::from_tensor(&d_p)?;
                            let d_p = buf.as_tensor().clone();
                            self.buffers.insert(param.name.clone(), buf);
                            d_p
                        }
                    };
                }

                let next = (param.tensor() - (d_p * group.lr)?)?;
                param.var.set(&next)?;
            }
        }

        Ok(())
    }

    /// Compute gradients of `loss` and apply one step.
    ///
    /// Gradients come from a fresh backward pass every call, so nothing
    /// accumulates across iterations.
    pub fn backward_step(&mut self, loss: &Tensor) -> Result<()> {
        let grads = loss.backward()?;
        self.step(&grads)
    }

    pub fn groups(&self) -> &[ParamGroup] {
        &self.groups
    }

    pub fn momentum(&self) -> f64 {
        self.momentum
    }

    /// Hyperparameters of every group
    pub fn state(&self) -> SgdState {
        SgdState {
            momentum: self.momentum,
            groups: self
                .groups
                .iter()
                .map(|g| GroupState {
                    lr: g.lr,
                    weight_decay: g.weight_decay,
                    params: g.params.iter().map(|p| p.name.clone()).collect(),
                })
                .collect(),
        }
    }

    /// Copies of the momentum buffers keyed by parameter name
    pub fn momentum_buffers(&self) -> Result<HashMap<String, Tensor>> {
        self.buffers
            .iter()
            .map(|(name, buf)| Ok((name.clone(), buf.as_tensor().copy()?)))
            .collect()
    }

    /// Restore hyperparameters and momentum buffers saved by [`Sgd::state`] and
    /// [`Sgd::momentum_buffers`].
    ///
    /// The saved groups must name exactly the parameters of the current groups.
    pub fn load_state(
        &mut self,
        state: &SgdState,
        buffers: &HashMap<String, Tensor>,
    ) -> crate::Result<()> {
        if state.groups.len() != self.groups.len() {
            return Err(crate::FcnError::Checkpoint(format!(
                "optimizer state has {} groups, expected {}",
                state.groups.len(),
                self.groups.len()
            )));
        }

        let mut params: HashMap<&str, &Parameter> = HashMap::new();
        for (saved, group) in state.groups.iter().zip(self.groups.iter()) {
            let names: Vec<&str> = group.params.iter().map(|p| p.name.as_str()).collect();
            if saved.params.iter().map(String::as_str).ne(names.iter().copied()) {
                return Err(crate::FcnError::Checkpoint(
                    "optimizer state does not match the parameter groups".to_string(),
                ));
            }
            params.extend(group.params.iter().map(|p| (p.name.as_str(), p)));
        }

        let mut restored = HashMap::new();
        for (name, tensor) in buffers {
            let param = params.get(name.as_str()).ok_or_else(|| {
                crate::FcnError::Checkpoint(format!(
                    "momentum buffer for unknown parameter {}",
                    name
                ))
            })?;
            if tensor.dims() != param.tensor().dims() {
                return Err(crate::FcnError::ShapeMismatch {
                    layer: name.clone(),
                    expected: param.tensor().dims().to_vec(),
                    found: tensor.dims().to_vec(),
                });
            }
            let tensor = tensor
                .to_dtype(param.tensor().dtype())?
                .to_device(param.tensor().device())?;
            restored.insert(name.clone(), Var::from_tensor(&tensor)?);
        }

        for (saved, group) in state.groups.iter().zip(self.groups.iter_mut()) {
            group.lr = saved.lr;
            group.weight_decay = saved.weight_decay;
        }
        self.momentum = state.momentum;
        self.buffers = restored;

        Ok(())
    }
}
