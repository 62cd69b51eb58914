use candle_core::{Device, Tensor, D};
use candle_latent::distributions::{DistributionFamily, KlMethod, ParamName};
use candle_latent::inference::{GradientInference, InferenceObjective, IsolationScope};
use candle_latent::models::InputName;
use candle_latent::{GradientBuffer, LatentError, LatentMode, LatentVariable, LatentVariableConfig};
use lentil::agent::{
    ACTION_INFERENCE_MODEL, Q_VALUE_MODELS, STATE_INFERENCE_MODEL, TARGET_ACTION_PRIOR_MODEL,
    TARGET_Q_VALUE_MODELS,
};
use lentil::config::{InputSizes, NetworkArgs};
use lentil::critic::TwinCritics;
use lentil::q_values::{estimate_q_values, QValueInputs};
use lentil::{
    Agent, AgentConfig, AgentError, OptimizerConfig, OptimizerKind, ParameterGroupOptimizer,
    StepInput, TargetUpdate,
};
use rand_distr::{Distribution, Normal};
use std::collections::HashSet;

const ITERATIVE_AGENT: &str = r#"{
    "n_observation": 3,
    "action": { "prior_dist": "normal", "approx_post_dist": "normal", "n_variables": 2 },
    "action_prior": { "inputs": ["observation", "action"], "layers": [8] },
    "action_inference": {
        "type": "iterative",
        "network": { "inputs": ["params", "grads", "observation"], "layers": [8], "activation": { "elu": 1.0 } },
        "n_inf_iters": 2,
        "n_inf_samples": 3
    },
    "q_value": { "inputs": ["observation", "action"], "layers": [8] },
    "misc": { "n_action_samples": 4 }
}"#;

const STATEFUL_AGENT: &str = r#"{
    "n_observation": 3,
    "action": { "prior_dist": "normal", "approx_post_dist": "normal", "n_variables": 2 },
    "action_prior": { "inputs": ["state", "action"], "layers": [8] },
    "action_inference": {
        "type": "iterative",
        "network": { "inputs": ["params", "grads", "state"], "layers": [8] },
        "n_inf_iters": 2,
        "n_inf_samples": 2
    },
    "state": {
        "variable": { "prior_dist": "normal", "approx_post_dist": "normal", "n_variables": 2 },
        "prior": { "inputs": ["state", "action"], "layers": [8] },
        "inference": {
            "type": "iterative",
            "network": { "inputs": ["params", "grads", "observation"], "layers": [8] },
            "n_inf_iters": 2,
            "n_inf_samples": 2
        }
    },
    "q_value": { "inputs": ["observation", "state", "action"], "layers": [8] },
    "misc": {
        "n_action_samples": 3,
        "epsilons": { "pi": 0.1, "state": 0.5 },
        "retrace_lambda": 0.9,
        "target_action": true,
        "normalize_returns": true,
        "kl_factor": { "state": 0.5, "action": 1.0 },
        "kl_factor_anneal_rate": { "state": 0.5, "action": 0.0 }
    }
}"#;

const CATEGORICAL_AGENT: &str = r#"{
    "n_observation": 3,
    "action": { "prior_dist": "categorical", "approx_post_dist": "categorical", "n_variables": 3 },
    "action_inference": {
        "type": "direct",
        "network": { "inputs": ["observation"], "layers": [8] }
    },
    "q_value": { "inputs": ["observation", "action"], "layers": [8] }
}"#;

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn random_rows(batch_size: usize, n: usize) -> anyhow::Result<Tensor> {
    let normal = Normal::new(0f32, 1.)?;
    let mut rng = rand::rng();
    let data = (0..batch_size * n)
        .map(|_| normal.sample(&mut rng))
        .collect::<Vec<_>>();
    Ok(Tensor::from_vec(data, (batch_size, n), &Device::Cpu)?)
}

fn max_abs_diff(a: &Tensor, b: &Tensor) -> anyhow::Result<f32> {
    Ok((a - b)?.abs()?.flatten_all()?.max(D::Minus1)?.to_scalar::<f32>()?)
}

#[test]
fn normal_variable_starts_with_zero_kl() -> anyhow::Result<()> {
    let config = LatentVariableConfig::new(DistributionFamily::Normal, 1);
    let mut z = LatentVariable::new(config, &Device::Cpu)?;
    z.reset(4)?;

    let prior = z.prior()?;
    let loc = prior.param(ParamName::Loc)?.flatten_all()?.to_vec1::<f32>()?;
    let scale = prior.param(ParamName::Scale)?.flatten_all()?.to_vec1::<f32>()?;
    assert!(loc.iter().all(|&x| x == 0.));
    assert!(scale.iter().all(|&x| (x - 1.).abs() < 1e-6));

    let x = z.sample(1, LatentMode::Generative)?;
    assert_eq!(x.dims(), &[4, 1]);
    let kl = z.kl_divergence(KlMethod::Analytic)?.flatten_all()?.to_vec1::<f32>()?;
    assert!(kl.iter().all(|&k| k.abs() < 1e-6));
    Ok(())
}

#[test]
fn categorical_samples_are_one_hot() -> anyhow::Result<()> {
    let config = LatentVariableConfig::new(DistributionFamily::Categorical, 3);
    let mut z = LatentVariable::new(config, &Device::Cpu)?;
    z.reset(2)?;
    let x = z.sample(1, LatentMode::Generative)?;
    assert_eq!(x.dims(), &[2, 3]);
    for row in x.to_vec2::<f32>()? {
        assert_eq!(row.iter().sum::<f32>(), 1.);
        assert_eq!(row.iter().filter(|&&v| v == 1.).count(), 1);
    }
    Ok(())
}

struct NegSquaredNorm;

impl InferenceObjective for NegSquaredNorm {
    fn estimate(&self, _: &LatentVariable, samples: &Tensor) -> candle_latent::Result<Tensor> {
        Ok(samples.sqr()?.sum_keepdim(D::Minus1)?.neg()?)
    }
}

#[test]
fn inference_moves_posterior_mean_towards_optimum() -> anyhow::Result<()> {
    init_logger();
    let dev = Device::Cpu;
    let config = LatentVariableConfig::new(DistributionFamily::Normal, 2);
    let mut action = LatentVariable::new(config, &dev)?;
    for (name, var) in action.named_generative_parameters()? {
        if name.ends_with("loc") {
            var.set(&Tensor::full(2f32, (1, 2), &dev)?)?;
        }
    }
    action.reset(3)?;

    let mut inference = GradientInference::new(0.1, 3, 512)?;
    let mut grads = GradientBuffer::new();
    inference.refine(&mut action, &NegSquaredNorm, &mut grads, &IsolationScope::default())?;

    let trace = inference.trace();
    assert_eq!(trace.dist_params.len(), 4);
    let dist = trace
        .dist_params
        .iter()
        .map(|p| -> anyhow::Result<f32> {
            Ok(p[&ParamName::Loc].abs()?.mean_all()?.to_scalar::<f32>()?)
        })
        .collect::<anyhow::Result<Vec<_>>>()?;
    for w in dist.windows(2) {
        assert!(w[1] < w[0], "{:?}", dist);
    }
    assert!(trace.improvement()?.is_some_and(|d| d > 0.));
    Ok(())
}

#[test]
fn params_and_grads_requires_backward() -> anyhow::Result<()> {
    let config = LatentVariableConfig::new(DistributionFamily::Normal, 2).with_posterior_input(4);
    let mut z = LatentVariable::new(config, &Device::Cpu)?;
    z.reset(2)?;
    assert!(matches!(
        z.params_and_grads(true),
        Err(LatentError::Precondition(_))
    ));
    Ok(())
}

#[test]
fn parameter_groups_are_disjoint() -> anyhow::Result<()> {
    let agent = Agent::new(AgentConfig::from_json_str(ITERATIVE_AGENT)?, &Device::Cpu)?;
    let groups = agent.parameters()?;
    for name in [ACTION_INFERENCE_MODEL, Q_VALUE_MODELS, TARGET_Q_VALUE_MODELS, "log_alphas"] {
        assert!(groups.contains_key(name), "missing group {}", name);
    }

    let mut seen = HashSet::new();
    let mut total = 0;
    for vars in groups.values() {
        for v in vars {
            assert!(seen.insert(v.id()));
            total += 1;
        }
    }
    assert_eq!(agent.grads().tracked().len(), total);
    Ok(())
}

#[test]
fn train_step_updates_critics_and_targets() -> anyhow::Result<()> {
    init_logger();
    let dev = Device::Cpu;
    let mut agent = Agent::new(AgentConfig::from_json_str(ITERATIVE_AGENT)?, &dev)?;
    let mut opt_config = OptimizerConfig::new(OptimizerKind::Adam, 1e-2);
    opt_config.norm_grad = Some(10.);
    opt_config.target_update = TargetUpdate::Soft { tau: 0.5 };
    let mut optimizer = ParameterGroupOptimizer::new(&agent, opt_config)?;

    let before = agent.state_dict()?;

    agent.reset(2, None, None)?;
    for t in 0..4 {
        let input = StepInput::new(random_rows(2, 3)?)
            .with_reward(Tensor::full(1f32, (2, 1), &dev)?)
            .with_action(random_rows(2, 2)?);
        let action = agent.act(input)?;
        assert_eq!(action.dims(), &[2, 2]);
        assert_eq!(agent.collector().len(), t + 1);
        // the update network trains online
        optimizer.step(&mut agent)?;
    }

    let metrics = agent.evaluate()?;
    assert!(metrics.contains_key("objective"));
    assert!(metrics["loss/q_value"] > 0.);
    assert!(metrics[&format!("grad_norm/{}", Q_VALUE_MODELS)] > 0.);
    assert!(metrics.contains_key("inference_improvement"));

    optimizer.apply(&mut agent)?;
    optimizer.zero_grad(&mut agent);
    optimizer.update_targets(&agent)?;

    let after = agent.state_dict()?;
    let changed = |group: &str| -> anyhow::Result<bool> {
        let mut any = false;
        for (name, x) in before[group].iter() {
            any |= max_abs_diff(x, &after[group][name])? > 0.;
        }
        Ok(any)
    };
    assert!(changed(Q_VALUE_MODELS)?);
    assert!(changed(TARGET_Q_VALUE_MODELS)?);
    assert!(changed(ACTION_INFERENCE_MODEL)?);

    let episode = agent.get_episode()?;
    assert_eq!(episode.observation.dims(), &[4, 2, 3]);
    Ok(())
}

#[test]
fn eval_mode_returns_categorical_indices() -> anyhow::Result<()> {
    let mut agent = Agent::new(AgentConfig::from_json_str(CATEGORICAL_AGENT)?, &Device::Cpu)?;
    agent.eval();
    agent.reset(3, None, None)?;
    let action = agent.act(StepInput::new(random_rows(3, 3)?))?;
    assert_eq!(action.dims(), &[3, 1]);
    let idx = action.flatten_all()?.to_vec1::<u32>()?;
    assert!(idx.iter().all(|&i| i < 3));

    // the next prior conditions on the one-hot action
    assert_eq!(agent.prev_action().map(|a| a.dims().to_vec()), Some(vec![3, 3]));
    Ok(())
}

#[test]
fn replayed_categorical_indices_are_accepted() -> anyhow::Result<()> {
    let mut agent = Agent::new(AgentConfig::from_json_str(CATEGORICAL_AGENT)?, &Device::Cpu)?;
    agent.reset(2, None, None)?;
    let replay = Tensor::new(&[[2u32], [0]], &Device::Cpu)?;
    let action = agent.act(StepInput::new(random_rows(2, 3)?).with_action(replay))?;
    assert_eq!(action.to_vec2::<f32>()?, vec![vec![0., 0., 1.], vec![1., 0., 0.]]);
    Ok(())
}

#[test]
fn unknown_component_fails_loudly() -> anyhow::Result<()> {
    let agent = Agent::new(AgentConfig::from_json_str(ITERATIVE_AGENT)?, &Device::Cpu)?;
    let mut sd = agent.state_dict()?;
    sd.insert("obs_likelihood_model".into(), Default::default());
    assert!(matches!(
        agent.load(&sd),
        Err(AgentError::UnknownComponent(_))
    ));
    Ok(())
}

#[test]
fn safetensors_round_trip() -> anyhow::Result<()> {
    let dev = Device::Cpu;
    let source = Agent::new(AgentConfig::from_json_str(ITERATIVE_AGENT)?, &dev)?;
    let target = Agent::new(AgentConfig::from_json_str(ITERATIVE_AGENT)?, &dev)?;

    let dir = tempfile::tempdir()?;
    let path = dir.path().join("agent.safetensors");
    source.save_safetensors(&path)?;
    let report = target.load_safetensors(&path)?;

    assert!(report.is_complete());
    let (a, b) = (source.state_dict()?, target.state_dict()?);
    for (component, entries) in a.iter() {
        for (name, x) in entries {
            assert_eq!(max_abs_diff(x, &b[component][name])?, 0.);
        }
    }
    Ok(())
}

#[test]
fn on_policy_estimate_is_isolated_from_later_updates() -> anyhow::Result<()> {
    let dev = Device::Cpu;
    let args = NetworkArgs::new(&[InputName::Observation, InputName::Action], &[8]);
    let sizes = InputSizes {
        observation: 3,
        action: 2,
        reward: 1,
        state: None,
        params: None,
    };
    let critics = TwinCritics::new(&args, &sizes, &dev)?;

    let obs = random_rows(2, 3)?;
    let actions = random_rows(10, 2)?;
    let inputs = QValueInputs {
        observation: &obs,
        state: None,
        reward: None,
    };
    let est = estimate_q_values(&critics, &inputs, None, &actions, None, 5)?;
    let stored = est.new_q_value.copy()?;

    for (_, v) in critics.named_live_parameters()? {
        v.set(&(v.as_tensor() + 1.)?)?;
    }
    assert_eq!(max_abs_diff(&est.new_q_value, &stored)?, 0.);

    let fresh = estimate_q_values(&critics, &inputs, None, &actions, None, 5)?;
    assert!(max_abs_diff(&fresh.new_q_value, &stored)? > 0.);
    Ok(())
}

#[test]
fn stateful_agent_with_target_action_trains() -> anyhow::Result<()> {
    init_logger();
    let dev = Device::Cpu;
    let mut agent = Agent::new(AgentConfig::from_json_str(STATEFUL_AGENT)?, &dev)?;
    let groups = agent.parameters()?;
    for name in [STATE_INFERENCE_MODEL, TARGET_ACTION_PRIOR_MODEL, "target_action_inference_model"] {
        assert!(groups.contains_key(name), "missing group {}", name);
    }
    let mut optimizer = ParameterGroupOptimizer::new(&agent, OptimizerConfig::new(OptimizerKind::Adam, 1e-2))?;
    let before = agent.state_dict()?;

    agent.reset(2, None, None)?;
    for _ in 0..4 {
        let input = StepInput::new(random_rows(2, 3)?)
            .with_reward(Tensor::full(0.5f32, (2, 1), &dev)?)
            .with_action(random_rows(2, 2)?);
        agent.act(input)?;
        optimizer.step(&mut agent)?;
    }

    let metrics = agent.evaluate()?;
    assert!(metrics["objective"].is_finite());
    assert!(metrics.contains_key("kl/state"));
    assert_eq!(metrics["kl_factor/state"], 0.5);
    assert_eq!(agent.kl_schedule().kl_factor.state, 1.);

    optimizer.apply(&mut agent)?;
    optimizer.zero_grad(&mut agent);
    optimizer.update_targets(&agent)?;

    let after = agent.state_dict()?;
    for group in [STATE_INFERENCE_MODEL, ACTION_INFERENCE_MODEL, Q_VALUE_MODELS] {
        let mut moved = false;
        for (name, x) in before[group].iter() {
            moved |= max_abs_diff(x, &after[group][name])? > 0.;
        }
        assert!(moved, "{} did not change", group);
    }
    Ok(())
}

