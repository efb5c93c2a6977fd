use std::fmt;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Reference to the workload whose replica count is driven by a PodAutoscaler.
#[derive(Serialize, Deserialize, JsonSchema, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ScaleTargetRef {
    /// API version of the referent, e.g. `apps/v1`.
    pub api_version: String,
    /// Kind of the referent, e.g. `Deployment`.
    pub kind: String,
    /// Name of the referent, in the PodAutoscaler's namespace.
    pub name: String,
}

impl ScaleTargetRef {
    /// Split `api_version` into group and version. Core group is the empty string.
    pub fn group_version(&self) -> Option<(&str, &str)> {
        match self.api_version.split_once('/') {
            Some((group, version)) if !group.is_empty() && !version.is_empty() => {
                Some((group, version))
            }
            Some(_) => None,
            None if !self.api_version.is_empty() => Some(("", self.api_version.as_str())),
            None => None,
        }
    }

    /// Reason the reference cannot be scaled, if any.
    pub fn validate(&self) -> Result<(), String> {
        if self.name.is_empty() {
            return Err("scaleTargetRef.name is empty".to_string());
        }
        if self.kind.is_empty() {
            return Err("scaleTargetRef.kind is empty".to_string());
        }
        if self.group_version().is_none() {
            return Err(format!(
                "scaleTargetRef.apiVersion `{}` is malformed",
                self.api_version
            ));
        }
        Ok(())
    }
}

/// Whether the revision is currently routable from its traffic targets.
#[derive(Serialize, Deserialize, JsonSchema, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub enum Reachability {
    #[default]
    Unknown,
    Reachable,
    Unreachable,
}

/// Scale status of a PodAutoscaler.
///
/// Cycles through `Activating -> Active -> Inactive -> Activating`.
#[derive(Serialize, Deserialize, JsonSchema, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "PascalCase")]
pub enum ScaleStatus {
    /// Capacity has been requested but no replica is ready yet.
    Activating,
    /// Ready replicas are serving traffic directly.
    Active,
    /// Scaled to zero, traffic is buffered at the proxy.
    Inactive,
}

impl fmt::Display for ScaleStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Activating => write!(f, "Activating"),
            Self::Active => write!(f, "Active"),
            Self::Inactive => write!(f, "Inactive"),
        }
    }
}

#[derive(Serialize, Deserialize, JsonSchema, CustomResource, Clone, Debug, PartialEq)]
#[kube(
    group = "autoscaling.scaleloop.dev",
    version = "v1alpha1",
    kind = "PodAutoscaler",
    shortname = "kpa",
    namespaced,
    status = "PodAutoscalerStatus",
    printcolumn = r#"{"name":"Status", "type":"string", "jsonPath":".status.scaleStatus"}"#,
    printcolumn = r#"{"name":"Desired", "type":"integer", "jsonPath":".status.desiredScale"}"#,
    printcolumn = r#"{"name":"Actual", "type":"integer", "jsonPath":".status.actualScale"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct PodAutoscalerSpec {
    /// Workload to scale through its `/scale` subresource.
    pub scale_target_ref: ScaleTargetRef,
    /// Hard concurrency limit per replica. Falls back to the configured default target if unset.
    #[serde(default)]
    pub container_concurrency: Option<i64>,
    /// Routability of the revision. Pending requests never activate an unreachable revision.
    #[serde(default)]
    pub reachability: Reachability,
}

#[derive(Serialize, Deserialize, JsonSchema, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PodAutoscalerStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale_status: Option<ScaleStatus>,
    /// Replica count last requested from the scale target.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desired_scale: Option<i32>,
    /// Ready replicas observed in the backing Endpoints.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual_scale: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<Time>,
    /// Start of the current period in which the decision asked for zero replicas.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idle_since: Option<Time>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
    /// Terminal problem preventing reconciliation, cleared once a pass succeeds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}
