//! Logical-axis sharding constraints.
//!
//! Activations are annotated with logical axis names such as
//! `activation_batch`. [`AxisRules`] map each logical name to an ordered list
//! of candidate mesh-axis groups; [`ShardingContext::partition_spec`] resolves a
//! full annotation into a per-dimension mesh placement. Everything runs in one
//! process, so [`ShardingContext::constrain`] only checks that the placement is
//! realisable (rank matches, every sharded dimension divides evenly) and hands
//! the tensor back unchanged.

use std::collections::HashSet;
use std::fmt;

use candle_core::Tensor;
use serde::{Deserialize, Serialize};

use crate::error::{DecoderError, Result};

/// Logical axes of a `[batch, seq, embed]` activation.
pub const ACTIVATION_AXES: [&str; 3] = ["activation_batch", "activation_norm_length", "activation_embed"];

/// Named mesh dimension.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeshAxis {
    pub name: String,
    pub size: usize,
}

/// Ordered set of named mesh axes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceMesh {
    axes: Vec<MeshAxis>,
}

impl DeviceMesh {
    pub fn new(axes: Vec<MeshAxis>) -> Result<Self> {
        let mut seen = HashSet::new();
        for axis in &axes {
            if axis.size == 0 {
                return Err(DecoderError::sharding(format!("mesh axis '{}' has size 0", axis.name)));
            }
            if !seen.insert(axis.name.as_str()) {
                return Err(DecoderError::sharding(format!("duplicate mesh axis '{}'", axis.name)));
            }
        }
        Ok(Self { axes })
    }

    pub fn axes(&self) -> &[MeshAxis] {
        &self.axes
    }

    pub fn axis_size(&self, name: &str) -> Option<usize> {
        self.axes.iter().find(|a| a.name == name).map(|a| a.size)
    }

    pub fn num_devices(&self) -> usize {
        self.axes.iter().map(|a| a.size).product()
    }
}

impl Default for DeviceMesh {
    /// Every axis has size one.
    fn default() -> Self {
        let axes = ["data", "fsdp", "sequence", "tensor", "expert"]
            .into_iter()
            .map(|name| MeshAxis {
                name: name.to_string(),
                size: 1,
            })
            .collect();
        Self { axes }
    }
}

/// One candidate placement for a logical axis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AxisRule {
    pub logical: String,
    pub mesh_axes: Vec<String>,
}

impl AxisRule {
    pub fn new(logical: &str, mesh_axes: &[&str]) -> Self {
        Self {
            logical: logical.to_string(),
            mesh_axes: mesh_axes.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// Ordered logical → mesh rules; earlier rules win.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AxisRules {
    rules: Vec<AxisRule>,
}

impl AxisRules {
    pub fn new(rules: Vec<AxisRule>) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &[AxisRule] {
        &self.rules
    }
}

impl Default for AxisRules {
    fn default() -> Self {
        Self::new(vec![
            AxisRule::new("activation_batch", &["data", "fsdp", "expert"]),
            AxisRule::new("activation_batch", &["data", "fsdp"]),
            AxisRule::new("activation_norm_length", &["sequence"]),
            AxisRule::new("activation_length", &["sequence"]),
            AxisRule::new("activation_embed", &["tensor"]),
            AxisRule::new("activation_heads", &["tensor"]),
            AxisRule::new("activation_mlp", &["tensor"]),
        ])
    }
}

/// Mesh placement per tensor dimension; `None` means replicated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionSpec(pub Vec<Option<Vec<String>>>);

impl fmt::Display for PartitionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .0
            .iter()
            .map(|dim| match dim {
                None => "None".to_string(),
                Some(axes) if axes.len() == 1 => format!("'{}'", axes[0]),
                Some(axes) => format!("({})", axes.iter().map(|a| format!("'{a}'")).collect::<Vec<_>>().join(", ")),
            })
            .collect();
        write!(f, "P({})", parts.join(", "))
    }
}

/// Serialized form of the mesh and rules.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShardingConfig {
    pub mesh: Vec<MeshAxis>,
    pub rules: Vec<AxisRule>,
}

impl Default for ShardingConfig {
    fn default() -> Self {
        Self {
            mesh: DeviceMesh::default().axes,
            rules: AxisRules::default().rules,
        }
    }
}

/// Mesh plus rules used to resolve and check constraints.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ShardingContext {
    mesh: DeviceMesh,
    rules: AxisRules,
}

impl ShardingContext {
    pub fn new(mesh: DeviceMesh, rules: AxisRules) -> Result<Self> {
        for rule in rules.rules() {
            for axis in &rule.mesh_axes {
                if mesh.axis_size(axis).is_none() {
                    return Err(DecoderError::sharding(format!(
                        "rule for '{}' names unknown mesh axis '{axis}'",
                        rule.logical
                    )));
                }
            }
        }
        log::info!(
            "sharding init: mesh={:?} devices={} rules={}",
            mesh.axes().iter().map(|a| (a.name.as_str(), a.size)).collect::<Vec<_>>(),
            mesh.num_devices(),
            rules.rules().len()
        );
        Ok(Self { mesh, rules })
    }

    pub fn from_config(config: &ShardingConfig) -> Result<Self> {
        Self::new(
            DeviceMesh::new(config.mesh.clone())?,
            AxisRules::new(config.rules.clone()),
        )
    }

    pub fn mesh(&self) -> &DeviceMesh {
        &self.mesh
    }

    /// Resolves logical axis names into mesh placements.
    ///
    /// A mesh axis is used by at most one dimension; a rule whose axes are
    /// already taken is skipped in favour of the next rule for the same name.
    pub fn partition_spec(&self, logical_axes: &[&str]) -> PartitionSpec {
        let mut used: HashSet<&str> = HashSet::new();
        let dims = logical_axes
            .iter()
            .map(|logical| {
                let rule = self
                    .rules
                    .rules
                    .iter()
                    .filter(|rule| rule.logical == *logical)
                    .find(|rule| rule.mesh_axes.iter().all(|a| !used.contains(a.as_str())))?;
                used.extend(rule.mesh_axes.iter().map(String::as_str));
                Some(rule.mesh_axes.clone())
            })
            .collect();
        PartitionSpec(dims)
    }

    /// Checks that `tensor` can be laid out as `logical_axes` on the mesh.
    pub fn constrain(&self, tensor: &Tensor, logical_axes: &[&str]) -> Result<Tensor> {
        let dims = tensor.dims();
        if dims.len() != logical_axes.len() {
            return Err(DecoderError::sharding(format!(
                "rank {} tensor annotated with {} logical axes {:?}",
                dims.len(),
                logical_axes.len(),
                logical_axes
            )));
        }
        let spec = self.partition_spec(logical_axes);
        for ((size, placement), logical) in dims.iter().zip(&spec.0).zip(logical_axes) {
            let Some(mesh_axes) = placement else { continue };
            let shards: usize = mesh_axes
                .iter()
                .filter_map(|a| self.mesh.axis_size(a))
                .product();
            if size % shards != 0 {
                return Err(DecoderError::sharding(format!(
                    "dimension '{logical}' of size {size} is not divisible by {shards} shards over {mesh_axes:?}"
                )));
            }
        }
        Ok(tensor.clone())
    }
}
