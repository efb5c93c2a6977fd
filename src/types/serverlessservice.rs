use std::fmt;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::ScaleTargetRef;

/// Traffic path selected by a ServerlessService.
#[derive(Serialize, Deserialize, JsonSchema, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "PascalCase")]
pub enum RoutingMode {
    /// Traffic goes straight to the revision's ready replicas.
    Serve,
    /// Traffic is buffered at the proxy until capacity is available.
    Proxy,
}

impl fmt::Display for RoutingMode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Serve => write!(f, "Serve"),
            Self::Proxy => write!(f, "Proxy"),
        }
    }
}

/// ServerlessServices toggle whether traffic for a revision is served directly or proxied.
///
/// Always created with the same namespace and name as the PodAutoscaler controlling it.
#[derive(Serialize, Deserialize, JsonSchema, CustomResource, Clone, Debug, PartialEq)]
#[kube(
    group = "networking.scaleloop.dev",
    version = "v1alpha1",
    kind = "ServerlessService",
    shortname = "sks",
    namespaced,
    status = "ServerlessServiceStatus",
    printcolumn = r#"{"name":"Mode", "type":"string", "jsonPath":".spec.mode"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ServerlessServiceSpec {
    pub mode: RoutingMode,
    /// Workload whose replicas back the service.
    pub object_ref: ScaleTargetRef,
}

#[derive(Serialize, Deserialize, JsonSchema, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServerlessServiceStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}
