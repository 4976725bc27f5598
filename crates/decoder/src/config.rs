//! Decoder configuration.
//!
//! Every field has a default, so partial TOML or JSON files are accepted.
//! [`DecoderConfig::from_path`] picks the format from the file extension and
//! validates the result; validation reports every problem at once.

use std::{fs, path::Path, str::FromStr};

use attention::MlaConfig;
use candle_core::DType;
use layers::{
    activations::parse_activations, dtypes::parse_dtype, ActivationKind, FeedForwardConfig,
    MoeConfig, RoutingScore,
};
use serde::{Deserialize, Serialize};

use crate::error::{DecoderError, Result};
use crate::sharding::ShardingConfig;

/// Which activations are kept for the backward pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RematPolicy {
    /// Recompute everything; nothing is saved.
    #[default]
    Full,
    /// Keep the tensor tagged `decoder_layer_input`.
    SaveDecoderLayerInput,
}

impl FromStr for RematPolicy {
    type Err = DecoderError;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim() {
            "full" => Ok(Self::Full),
            "save_decoder_layer_input" => Ok(Self::SaveDecoderLayerInput),
            other => Err(DecoderError::config(format!("unknown remat_policy '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecoderConfig {
    pub emb_dim: usize,
    pub num_query_heads: usize,
    pub q_lora_rank: usize,
    pub kv_lora_rank: usize,
    pub qk_nope_head_dim: usize,
    pub qk_rope_head_dim: usize,
    /// Value head width.
    pub head_dim: usize,
    pub mlp_dim: usize,
    pub mlp_activations: Vec<String>,
    pub num_experts: usize,
    pub num_experts_per_tok: usize,
    pub num_shared_experts: usize,
    pub routed_score_func: String,
    pub norm_topk_prob: bool,
    pub routed_scaling_factor: f32,
    pub load_balance_loss_weight: f32,
    pub num_decoder_layers: usize,
    pub first_num_dense_layers: usize,
    pub normalization_layer_epsilon: f64,
    pub dropout_rate: f32,
    pub rope_max_timescale: f32,
    pub max_target_length: usize,
    pub max_prefill_predict_length: usize,
    pub dtype: String,
    pub weight_dtype: String,
    pub scan_layers: bool,
    pub record_internal_nn_metrics: bool,
    pub remat_policy: RematPolicy,
    pub init_seed: u64,
    pub sharding: ShardingConfig,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            emb_dim: 64,
            num_query_heads: 4,
            q_lora_rank: 0,
            kv_lora_rank: 32,
            qk_nope_head_dim: 16,
            qk_rope_head_dim: 8,
            head_dim: 16,
            mlp_dim: 32,
            mlp_activations: vec!["silu".to_string(), "linear".to_string()],
            num_experts: 4,
            num_experts_per_tok: 2,
            num_shared_experts: 1,
            routed_score_func: "softmax".to_string(),
            norm_topk_prob: false,
            routed_scaling_factor: 1.0,
            load_balance_loss_weight: 0.0,
            num_decoder_layers: 2,
            first_num_dense_layers: 1,
            normalization_layer_epsilon: 1e-6,
            dropout_rate: 0.0,
            rope_max_timescale: 10_000.0,
            max_target_length: 128,
            max_prefill_predict_length: 64,
            dtype: "float32".to_string(),
            weight_dtype: "float32".to_string(),
            scan_layers: false,
            record_internal_nn_metrics: false,
            remat_policy: RematPolicy::Full,
            init_seed: 0,
            sharding: ShardingConfig::default(),
        }
    }
}

impl DecoderConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| DecoderError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: DecoderConfig = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&contents)?,
            Some("toml") | None => toml::from_str(&contents)?,
            Some(other) => {
                return Err(DecoderError::config(format!(
                    "unsupported configuration extension '{other}'"
                )));
            }
        };
        config.validate()?;
        log::info!(
            "loaded decoder config from {}: layers={} dense={} emb_dim={} dtype={}",
            path.display(),
            config.num_decoder_layers,
            config.first_num_dense_layers,
            config.emb_dim,
            config.dtype
        );
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        if self.emb_dim == 0 {
            errors.push("emb_dim must be greater than 0".to_string());
        }
        if self.num_query_heads == 0 {
            errors.push("num_query_heads must be greater than 0".to_string());
        }
        if self.kv_lora_rank == 0 {
            errors.push("kv_lora_rank must be greater than 0".to_string());
        }
        if self.qk_rope_head_dim == 0 || self.qk_rope_head_dim % 2 != 0 {
            errors.push("qk_rope_head_dim must be even and greater than 0".to_string());
        }
        if self.head_dim == 0 {
            errors.push("head_dim must be greater than 0".to_string());
        }
        if self.mlp_dim == 0 {
            errors.push("mlp_dim must be greater than 0".to_string());
        }
        if let Err(err) = parse_activations(self.mlp_activations.as_slice()) {
            errors.push(err.to_string());
        }
        if self.mlp_activations.is_empty() {
            errors.push("mlp_activations must not be empty".to_string());
        }
        if self.first_num_dense_layers > self.num_decoder_layers {
            errors.push(format!(
                "first_num_dense_layers ({}) cannot exceed num_decoder_layers ({})",
                self.first_num_dense_layers, self.num_decoder_layers
            ));
        }
        if self.first_num_dense_layers > 0
            && self.num_experts_per_tok + self.num_shared_experts == 0
        {
            errors.push(
                "dense layers need num_experts_per_tok + num_shared_experts > 0 to size their MLP"
                    .to_string(),
            );
        }
        if self.num_decoder_layers > self.first_num_dense_layers {
            if self.num_experts == 0 {
                errors.push("num_experts must be greater than 0 for MoE layers".to_string());
            }
            if self.num_experts_per_tok == 0 || self.num_experts_per_tok > self.num_experts {
                errors.push(format!(
                    "num_experts_per_tok ({}) must be within 1..={}",
                    self.num_experts_per_tok, self.num_experts
                ));
            }
            if self.num_shared_experts == 0 {
                errors.push("num_shared_experts must be greater than 0 for MoE layers".to_string());
            }
        }
        if self.routed_score_func.parse::<RoutingScore>().is_err() {
            errors.push(format!("unknown routed_score_func '{}'", self.routed_score_func));
        }
        if self.load_balance_loss_weight < 0.0 {
            errors.push("load_balance_loss_weight must be >= 0".to_string());
        }
        if self.normalization_layer_epsilon <= 0.0 {
            errors.push("normalization_layer_epsilon must be greater than 0".to_string());
        }
        if !(0.0..1.0).contains(&self.dropout_rate) {
            errors.push("dropout_rate must be in [0, 1)".to_string());
        }
        if self.rope_max_timescale <= 0.0 {
            errors.push("rope_max_timescale must be greater than 0".to_string());
        }
        if self.max_prefill_predict_length > self.max_target_length {
            errors.push(
                "max_prefill_predict_length cannot exceed max_target_length".to_string(),
            );
        }
        for (field, value) in [("dtype", &self.dtype), ("weight_dtype", &self.weight_dtype)] {
            if parse_dtype(value).is_err() {
                errors.push(format!("{field} '{value}' is not a supported float dtype"));
            }
        }
        if self.sharding.mesh.iter().any(|axis| axis.size == 0) {
            errors.push("sharding.mesh axis sizes must be greater than 0".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(DecoderError::Config(errors))
        }
    }

    /// Activation (storage) dtype.
    pub fn activation_dtype(&self) -> Result<DType> {
        Ok(parse_dtype(&self.dtype)?)
    }

    pub fn parameter_dtype(&self) -> Result<DType> {
        Ok(parse_dtype(&self.weight_dtype)?)
    }

    pub fn activations(&self) -> Result<Vec<ActivationKind>> {
        Ok(parse_activations(self.mlp_activations.as_slice())?)
    }

    pub fn mla_config(&self) -> MlaConfig {
        MlaConfig {
            hidden_size: self.emb_dim,
            num_heads: self.num_query_heads,
            q_lora_rank: self.q_lora_rank,
            kv_lora_rank: self.kv_lora_rank,
            qk_nope_head_dim: self.qk_nope_head_dim,
            qk_rope_head_dim: self.qk_rope_head_dim,
            v_head_dim: self.head_dim,
            rope_theta: self.rope_max_timescale,
            max_target_length: self.max_target_length,
            max_prefill_predict_length: self.max_prefill_predict_length,
            dropout_rate: self.dropout_rate,
            norm_epsilon: self.normalization_layer_epsilon,
        }
    }

    /// MLP of a dense layer: `mlp_dim * (num_experts_per_tok + num_shared_experts)` wide.
    pub fn dense_mlp_config(&self) -> Result<FeedForwardConfig> {
        self.mlp_config(self.mlp_dim * (self.num_experts_per_tok + self.num_shared_experts))
    }

    /// Shared-expert MLP of a MoE layer: `mlp_dim * num_shared_experts` wide.
    pub fn shared_mlp_config(&self) -> Result<FeedForwardConfig> {
        self.mlp_config(self.mlp_dim * self.num_shared_experts)
    }

    fn mlp_config(&self, intermediate: usize) -> Result<FeedForwardConfig> {
        Ok(FeedForwardConfig {
            dropout_rate: self.dropout_rate,
            ..FeedForwardConfig::new(self.emb_dim, intermediate, self.activations()?)
        })
    }

    pub fn moe_config(&self) -> Result<MoeConfig> {
        Ok(MoeConfig {
            hidden_size: self.emb_dim,
            mlp_dim: self.mlp_dim,
            num_experts: self.num_experts,
            num_experts_per_tok: self.num_experts_per_tok,
            activations: self.activations()?,
            score: self.routed_score_func.parse()?,
            norm_topk_prob: self.norm_topk_prob,
            routed_scaling_factor: self.routed_scaling_factor,
            load_balance_loss_weight: self.load_balance_loss_weight,
        })
    }

    pub fn num_moe_layers(&self) -> usize {
        self.num_decoder_layers.saturating_sub(self.first_num_dense_layers)
    }
}
