/// Named learnable parameters backed by a candle `VarMap`
use candle_core::{DType, Device, Shape, Tensor, Var};
use candle_nn::{Init, VarMap};
use std::collections::HashMap;

/// Handle to a learnable parameter
#[derive(Debug, Clone)]
pub struct Parameter {
    /// Fully qualified name, e.g. `conv1_1.weight`
    pub name: String,
    pub var: Var,
}

impl Parameter {
    pub fn new(name: impl Into<String>, var: Var) -> Self {
        Self {
            name: name.into(),
            var,
        }
    }

    pub fn tensor(&self) -> &Tensor {
        self.var.as_tensor()
    }
}

/// Owner of every learnable variable of one model instance
#[derive(Clone)]
pub struct ParamStore {
    varmap: VarMap,
    dtype: DType,
    device: Device,
}

impl std::fmt::Debug for ParamStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParamStore")
            .field("dtype", &self.dtype)
            .field("device", &self.device)
            .finish()
    }
}

impl ParamStore {
    pub fn new(dtype: DType, device: &Device) -> Self {
        Self {
            varmap: VarMap::new(),
            dtype,
            device: device.clone(),
        }
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Create and register a new variable under `path`.
    pub fn var<S: Into<Shape>>(&self, path: &str, shape: S, init: Init) -> crate::Result<Var> {
        let var = init.var(shape, self.dtype, &self.device)?;

        let mut data = self.varmap.data().lock().map_err(|_| {
            crate::FcnError::Model("parameter store lock poisoned".to_string())
        })?;
        if data.contains_key(path) {
            return Err(crate::FcnError::Model(format!(
                "parameter {} registered twice",
                path
            )));
        }
        data.insert(path.to_string(), var.clone());

        Ok(var)
    }

    /// Snapshot of every variable keyed by name
    ///
    /// The tensors are copies; later updates to the variables do not show through.
    pub fn tensors(&self) -> crate::Result<HashMap<String, Tensor>> {
        self.shared()?
            .into_iter()
            .map(|(name, tensor)| Ok((name, tensor.copy()?)))
            .collect()
    }

    /// Overwrite every variable with the current values of `other`.
    pub fn copy_from(&self, other: &ParamStore) -> crate::Result<()> {
        self.load(&other.shared()?)
    }

    /// Handles sharing storage with the variables
    fn shared(&self) -> crate::Result<HashMap<String, Tensor>> {
        let data = self.varmap.data().lock().map_err(|_| {
            crate::FcnError::Model("parameter store lock poisoned".to_string())
        })?;

        Ok(data
            .iter()
            .map(|(name, var)| (name.clone(), var.as_tensor().clone()))
            .collect())
    }

    /// Overwrite every variable from `tensors`.
    ///
    /// Loading is strict: a missing name, an unexpected name or a shape
    /// difference fails before any variable is written.
    pub fn load(&self, tensors: &HashMap<String, Tensor>) -> crate::Result<()> {
        let data = self.varmap.data().lock().map_err(|_| {
            crate::FcnError::Model("parameter store lock poisoned".to_string())
        })?;

        if let Some(unexpected) = tensors.keys().find(|name| !data.contains_key(*name)) {
            return Err(crate::FcnError::Checkpoint(format!(
                "unexpected parameter {} in state",
                unexpected
            )));
        }

        for (name, var) in data.iter() {
            let tensor = tensors.get(name).ok_or_else(|| {
                crate::FcnError::Checkpoint(format!("missing parameter {} in state", name))
            })?;
            if tensor.dims() != var.dims() {
                return Err(crate::FcnError::ShapeMismatch {
                    layer: name.clone(),
                    expected: var.dims().to_vec(),
                    found: tensor.dims().to_vec(),
                });
            }
        }

        for (name, var) in data.iter() {
            let tensor = &tensors[name];
            var.set(&tensor.to_dtype(var.dtype())?.to_device(var.device())?)?;
        }

        Ok(())
    }

    pub fn len(&self) -> usize {
        self.varmap.all_vars().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
