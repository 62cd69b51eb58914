use crate::agent::Agent;
use crate::error::{AgentError, Result};

use candle_core::{Device, Tensor};
use log::{info, warn};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

/// component name → (parameter name → value)
pub type StateDict = BTreeMap<String, BTreeMap<String, Tensor>>;

/// Outcome of `Agent::load`
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LoadReport {
    pub loaded: Vec<String>,
    /// components present in the agent whose saved entries did not match
    pub skipped: Vec<String>,
}

impl LoadReport {
    pub fn is_complete(&self) -> bool {
        self.skipped.is_empty()
    }
}

impl Agent {
    /// detached copies of every parameter group
    pub fn state_dict(&self) -> Result<StateDict> {
        let mut ret = StateDict::new();
        for (component, params) in self.named_parameters()? {
            let mut entries = BTreeMap::new();
            for (name, var) in params {
                entries.insert(name, var.as_tensor().copy()?.detach());
            }
            ret.insert(component, entries);
        }
        Ok(ret)
    }

    /// Load saved parameters. A component the agent does not have is an
    /// error; a known component whose entries do not line up is skipped
    /// whole and reported.
    pub fn load(&self, state_dict: &StateDict) -> Result<LoadReport> {
        let groups = self.named_parameters()?;
        if let Some(unknown) = state_dict.keys().find(|k| !groups.contains_key(*k)) {
            return Err(AgentError::UnknownComponent(unknown.clone()));
        }

        let mut report = LoadReport::default();
        for (component, saved) in state_dict.iter() {
            let Some(params) = groups.get(component) else {
                continue;
            };

            let mismatch = params.iter().find_map(|(name, var)| match saved.get(name) {
                None => Some(format!("missing `{}`", name)),
                Some(x) if x.dims() != var.dims() => Some(format!(
                    "`{}` has shape {:?}, expected {:?}",
                    name,
                    x.dims(),
                    var.dims()
                )),
                Some(_) => None,
            });
            if let Some(reason) = mismatch {
                warn!("could not load {}: {}", component, reason);
                report.skipped.push(component.clone());
                continue;
            }

            for (name, var) in params.iter() {
                if let Some(x) = saved.get(name) {
                    let x = x.to_device(var.device())?.to_dtype(var.dtype())?;
                    var.set(&x)?;
                }
            }
            report.loaded.push(component.clone());
        }
        info!(
            "loaded {} components, skipped {}",
            report.loaded.len(),
            report.skipped.len()
        );
        Ok(report)
    }

    pub fn save_safetensors<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut flat = HashMap::new();
        for (component, entries) in self.state_dict()? {
            for (name, x) in entries {
                flat.insert(format!("{}/{}", component, name), x);
            }
        }
        candle_core::safetensors::save(&flat, path.as_ref())?;
        info!("saved {} tensors to {}", flat.len(), path.as_ref().display());
        Ok(())
    }

    pub fn load_safetensors<P: AsRef<Path>>(&self, path: P) -> Result<LoadReport> {
        let flat = candle_core::safetensors::load(path.as_ref(), &Device::Cpu)?;
        let mut state_dict = StateDict::new();
        for (key, x) in flat {
            let (component, name) = key.split_once('/').ok_or_else(|| {
                AgentError::Precondition(format!("tensor `{}` has no component prefix", key))
            })?;
            state_dict
                .entry(component.to_string())
                .or_default()
                .insert(name.to_string(), x);
        }
        self.load(&state_dict)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{ACTION_PRIOR_MODEL, Q_VALUE_MODELS};
    use crate::config::{AgentConfig, InferenceArgs, NetworkArgs, VariableArgs};
    use candle_latent::models::InputName;

    fn agent() -> Result<Agent> {
        let config = AgentConfig {
            n_observation: 3,
            action: VariableArgs::new("normal", 2),
            action_prior: None,
            action_inference: InferenceArgs::Direct {
                network: NetworkArgs::new(&[InputName::Observation], &[4]),
            },
            state: None,
            q_value: NetworkArgs::new(&[InputName::Observation, InputName::Action], &[4]),
            misc: Default::default(),
        };
        Agent::new(config, &Device::Cpu)
    }

    #[test]
    fn test_unknown_component_is_an_error() -> Result<()> {
        let agent = agent()?;
        let mut sd = agent.state_dict()?;
        sd.insert("reward_likelihood_model".into(), BTreeMap::new());
        assert!(matches!(
            agent.load(&sd),
            Err(AgentError::UnknownComponent(name)) if name == "reward_likelihood_model"
        ));
        Ok(())
    }

    #[test]
    fn test_mismatched_component_is_skipped() -> Result<()> {
        let source = agent()?;
        let target = agent()?;
        let mut sd = source.state_dict()?;
        if let Some(entries) = sd.get_mut(ACTION_PRIOR_MODEL) {
            for x in entries.values_mut() {
                *x = Tensor::zeros(7, x.dtype(), x.device())?;
            }
        }
        let report = target.load(&sd)?;
        assert_eq!(report.skipped, vec![ACTION_PRIOR_MODEL.to_string()]);
        assert!(report.loaded.contains(&Q_VALUE_MODELS.to_string()));

        let after = target.state_dict()?;
        for (name, x) in sd[Q_VALUE_MODELS].iter() {
            let d = (x - &after[Q_VALUE_MODELS][name])?
                .abs()?
                .max_all()?
                .to_scalar::<f32>()?;
            assert_eq!(d, 0.);
        }
        Ok(())
    }
}
