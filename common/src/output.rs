// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Output resources
//!
//! Deploying one logical resource produces a set of platform-level
//! *output resources* (a container, a secret, a role binding, ...).  Each
//! is identified by a `local_id` that is stable across renders of the same
//! logical resource, and by a `physical_id` assigned by the platform when
//! the output is actually created.  Dependencies between outputs are
//! declared by local id and must form a DAG.

use serde::Deserialize;
use serde::Serialize;

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputResource {
    /// Stable logical identifier, unique within one render.
    pub local_id: String,
    /// Physical identifier assigned at creation time.  Unset until the
    /// output has actually been created.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Whether the control plane owns this output's lifecycle.  Only
    /// managed outputs are deleted during garbage collection and teardown.
    #[serde(default)]
    pub managed: bool,
    /// Local ids of outputs that must exist before this one is created.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,
}

impl OutputResource {
    /// Returns the physical id in the normalized form used for
    /// comparisons: lowercased, with any trailing slash removed.  Local
    /// ids are never used for cross-render identity since renderers may
    /// reassign them.
    pub fn normalized_physical_id(&self) -> Option<String> {
        self.id
            .as_deref()
            .map(|id| id.trim_end_matches('/').to_lowercase())
    }
}

/// Deployment-derived portion of a resource record: the compute binding
/// plus the output resources of the most recent successful render.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compute: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub output_resources: Vec<OutputResource>,
}

#[cfg(test)]
mod test {
    use super::OutputResource;

    #[test]
    fn test_normalized_physical_id() {
        let mut output = OutputResource {
            local_id: String::from("Deployment"),
            id: Some(String::from(
                "/Subscriptions/S1/Providers/Test/Things/A/",
            )),
            managed: true,
            dependencies: vec![],
        };
        assert_eq!(
            output.normalized_physical_id().unwrap(),
            "/subscriptions/s1/providers/test/things/a"
        );

        output.id = None;
        assert_eq!(output.normalized_physical_id(), None);
    }

    #[test]
    fn test_wire_defaults() {
        let output: OutputResource =
            serde_json::from_value(serde_json::json!({
                "localId": "Service"
            }))
            .unwrap();
        assert_eq!(output.local_id, "Service");
        assert_eq!(output.id, None);
        assert!(!output.managed);
        assert!(output.dependencies.is_empty());
    }
}
