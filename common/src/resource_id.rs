// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Hierarchical resource identifiers
//!
//! Every resource managed by the control plane is addressed by a
//! plane-scoped identifier of the form:
//!
//! ```text
//! /planes/{planeType}/{planeName}[/resourceGroups/{group}]
//!     [/providers/{Namespace}/{type}/{name}[/{type}/{name}...]]
//! ```
//!
//! The trailing `{name}` may be omitted, in which case the identifier
//! refers to a collection of resources rather than a single one.
//! Identifiers compare and hash case-insensitively, but the original
//! casing is preserved for display.

use crate::error::Error;
use schemars::JsonSchema;
use serde::Deserialize;
use serde::Serialize;
use std::fmt;
use std::hash::Hash;
use std::hash::Hasher;
use std::str::FromStr;

/// One `{type}` or `{type}/{name}` step under the `providers` segment.
#[derive(Clone, Debug)]
pub struct TypeSegment {
    pub type_name: String,
    pub name: Option<String>,
}

/// A parsed, validated resource identifier
///
/// `ResourceId` is immutable once parsed.  Use [`ResourceId::from_str`] (or
/// serde deserialization) to construct one; malformed input produces a
/// structured error rather than a partially-parsed identifier.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(try_from = "String", into = "String")]
pub struct ResourceId {
    plane_type: String,
    plane_name: String,
    resource_group: Option<String>,
    provider_namespace: Option<String>,
    type_segments: Vec<TypeSegment>,
}

impl ResourceId {
    /// Returns the plane scope: `/planes/{planeType}/{planeName}`.
    pub fn plane_scope(&self) -> String {
        format!("/planes/{}/{}", self.plane_type, self.plane_name)
    }

    /// Returns the full scope prefix, including the resource group when
    /// one is present.
    pub fn root_scope(&self) -> String {
        match &self.resource_group {
            Some(group) => {
                format!("{}/resourceGroups/{}", self.plane_scope(), group)
            }
            None => self.plane_scope(),
        }
    }

    pub fn resource_group(&self) -> Option<&str> {
        self.resource_group.as_deref()
    }

    pub fn provider_namespace(&self) -> Option<&str> {
        self.provider_namespace.as_deref()
    }

    /// Returns the namespace-qualified type, e.g.
    /// `Terrane.Core/containers`, or `None` for a bare scope.
    pub fn qualified_type(&self) -> Option<String> {
        let namespace = self.provider_namespace.as_deref()?;
        let mut qualified = String::from(namespace);
        for segment in &self.type_segments {
            qualified.push('/');
            qualified.push_str(&segment.type_name);
        }
        Some(qualified)
    }

    /// Returns the name of the addressed resource, or `None` for a scope
    /// or collection identifier.
    pub fn name(&self) -> Option<&str> {
        self.type_segments.last().and_then(|s| s.name.as_deref())
    }

    /// Returns true if this identifier addresses a collection (a trailing
    /// type segment with no name).
    pub fn is_collection(&self) -> bool {
        match self.type_segments.last() {
            Some(segment) => segment.name.is_none(),
            None => false,
        }
    }

    /// Derives the identifier under which the status of an asynchronous
    /// operation on this resource is tracked.
    pub fn operation_status_id(
        &self,
        location: &str,
        operation_id: &uuid::Uuid,
    ) -> String {
        self.operation_tracking_id(location, operation_id, "operationstatuses")
    }

    /// Derives the identifier under which the result of an asynchronous
    /// operation on this resource is tracked.
    pub fn operation_result_id(
        &self,
        location: &str,
        operation_id: &uuid::Uuid,
    ) -> String {
        self.operation_tracking_id(location, operation_id, "operationresults")
    }

    fn operation_tracking_id(
        &self,
        location: &str,
        operation_id: &uuid::Uuid,
        collection: &str,
    ) -> String {
        let namespace = self.provider_namespace.as_deref().unwrap_or("System");
        format!(
            "{}/providers/{}/locations/{}/{}/{}",
            self.plane_scope(),
            namespace,
            location,
            collection,
            operation_id
        )
    }

    fn canonical_lowercase(&self) -> String {
        self.to_string().to_lowercase()
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/planes/{}/{}", self.plane_type, self.plane_name)?;
        if let Some(group) = &self.resource_group {
            write!(f, "/resourceGroups/{}", group)?;
        }
        if let Some(namespace) = &self.provider_namespace {
            write!(f, "/providers/{}", namespace)?;
            for segment in &self.type_segments {
                write!(f, "/{}", segment.type_name)?;
                if let Some(name) = &segment.name {
                    write!(f, "/{}", name)?;
                }
            }
        }
        Ok(())
    }
}

impl PartialEq for ResourceId {
    fn eq(&self, other: &Self) -> bool {
        self.canonical_lowercase() == other.canonical_lowercase()
    }
}

impl Eq for ResourceId {}

impl Hash for ResourceId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.canonical_lowercase().hash(state);
    }
}

impl FromStr for ResourceId {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let invalid = |message: &str| Error::InvalidValue {
            label: String::from("id"),
            message: format!("{}: {:?}", message, value),
        };

        let trimmed = value.strip_prefix('/').ok_or_else(|| {
            invalid("resource id must begin with \"/planes\"")
        })?;
        let mut parts = trimmed.split('/');

        let keyword = parts.next().unwrap_or("");
        if !keyword.eq_ignore_ascii_case("planes") {
            return Err(invalid("resource id must begin with \"/planes\""));
        }

        let mut take_nonempty = |what: &str| {
            parts
                .next()
                .filter(|p| !p.is_empty())
                .map(str::to_owned)
                .ok_or_else(|| invalid(what))
        };

        let plane_type = take_nonempty("missing plane type")?;
        let plane_name = take_nonempty("missing plane name")?;

        let mut resource_group = None;
        let mut provider_namespace = None;
        let mut type_segments = Vec::new();

        let mut next = parts.next();
        if let Some(keyword) = next {
            if keyword.eq_ignore_ascii_case("resourceGroups") {
                let group = parts
                    .next()
                    .filter(|p| !p.is_empty())
                    .ok_or_else(|| invalid("missing resource group name"))?;
                resource_group = Some(group.to_owned());
                next = parts.next();
            }
        }

        if let Some(keyword) = next {
            if !keyword.eq_ignore_ascii_case("providers") {
                return Err(invalid("expected \"providers\" segment"));
            }
            let namespace = parts
                .next()
                .filter(|p| !p.is_empty())
                .ok_or_else(|| invalid("missing provider namespace"))?;
            provider_namespace = Some(namespace.to_owned());

            loop {
                let type_name = match parts.next() {
                    None => break,
                    Some(p) if p.is_empty() => {
                        return Err(invalid("empty type segment"))
                    }
                    Some(p) => p.to_owned(),
                };
                let name = match parts.next() {
                    None => None,
                    Some(p) if p.is_empty() => {
                        return Err(invalid("empty resource name"))
                    }
                    Some(p) => Some(p.to_owned()),
                };
                type_segments.push(TypeSegment { type_name, name });
            }

            if type_segments.is_empty() {
                return Err(invalid("provider namespace without a type"));
            }
        }

        Ok(ResourceId {
            plane_type,
            plane_name,
            resource_group,
            provider_namespace,
            type_segments,
        })
    }
}

impl TryFrom<String> for ResourceId {
    type Error = Error;
    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ResourceId> for String {
    fn from(id: ResourceId) -> String {
        id.to_string()
    }
}

impl JsonSchema for ResourceId {
    fn schema_name() -> String {
        "ResourceId".to_string()
    }
    fn json_schema(
        _gen: &mut schemars::gen::SchemaGenerator,
    ) -> schemars::schema::Schema {
        schemars::schema::Schema::Object(schemars::schema::SchemaObject {
            metadata: Some(Box::new(schemars::schema::Metadata {
                title: Some("A plane-scoped resource identifier".to_string()),
                description: Some(
                    "Resource identifiers begin with \"/planes\" and name a \
                     plane, an optional resource group, and an optional \
                     provider-qualified resource."
                        .to_string(),
                ),
                ..Default::default()
            })),
            instance_type: Some(schemars::schema::SingleOrVec::Single(
                Box::new(schemars::schema::InstanceType::String),
            )),
            ..Default::default()
        })
    }
}

#[cfg(test)]
mod test {
    use super::ResourceId;
    use crate::error::Error;

    #[test]
    fn test_parse_resource() {
        let id: ResourceId =
            "/planes/terrane/local/resourceGroups/rg1/providers/\
             Terrane.Core/containers/frontend"
                .parse()
                .unwrap();
        assert_eq!(id.plane_scope(), "/planes/terrane/local");
        assert_eq!(
            id.root_scope(),
            "/planes/terrane/local/resourceGroups/rg1"
        );
        assert_eq!(id.resource_group(), Some("rg1"));
        assert_eq!(id.provider_namespace(), Some("Terrane.Core"));
        assert_eq!(
            id.qualified_type().unwrap(),
            "Terrane.Core/containers"
        );
        assert_eq!(id.name(), Some("frontend"));
        assert!(!id.is_collection());
    }

    #[test]
    fn test_parse_collection_and_scope() {
        let collection: ResourceId =
            "/planes/terrane/local/resourceGroups/rg1/providers/\
             Terrane.Core/containers"
                .parse()
                .unwrap();
        assert!(collection.is_collection());
        assert_eq!(collection.name(), None);

        let scope: ResourceId =
            "/planes/terrane/local/resourceGroups/rg1".parse().unwrap();
        assert_eq!(scope.qualified_type(), None);
        assert!(!scope.is_collection());

        let plane: ResourceId = "/planes/terrane/local".parse().unwrap();
        assert_eq!(plane.root_scope(), "/planes/terrane/local");
    }

    #[test]
    fn test_case_insensitive_equality() {
        let a: ResourceId = "/planes/terrane/local/resourceGroups/RG1/\
             providers/Terrane.Core/containers/Frontend"
            .parse()
            .unwrap();
        let b: ResourceId = "/planes/Terrane/Local/resourcegroups/rg1/\
             providers/terrane.core/containers/frontend"
            .parse()
            .unwrap();
        assert_eq!(a, b);

        // Display preserves the original casing.
        assert!(a.to_string().contains("RG1"));
    }

    #[test]
    fn test_parse_errors() {
        let cases = [
            "",
            "planes/terrane/local",
            "/planes",
            "/planes/terrane",
            "/planes/terrane/local/resourceGroups",
            "/planes/terrane/local/resourceGroups/rg1/providers",
            "/planes/terrane/local/resourceGroups/rg1/providers/Ns",
            "/planes/terrane/local/widgets/w1",
        ];
        for case in cases {
            let result: Result<ResourceId, Error> = case.parse();
            assert!(result.is_err(), "expected parse failure: {:?}", case);
        }
    }

    #[test]
    fn test_operation_tracking_ids() {
        let id: ResourceId =
            "/planes/terrane/local/resourceGroups/rg1/providers/\
             Terrane.Core/containers/frontend"
                .parse()
                .unwrap();
        let operation_id =
            "f55735a4-e56b-4709-8e9d-ae9fcca5d4e6".parse().unwrap();
        assert_eq!(
            id.operation_status_id("global", &operation_id),
            "/planes/terrane/local/providers/Terrane.Core/locations/\
             global/operationstatuses/f55735a4-e56b-4709-8e9d-ae9fcca5d4e6"
        );
        assert_eq!(
            id.operation_result_id("global", &operation_id),
            "/planes/terrane/local/providers/Terrane.Core/locations/\
             global/operationresults/f55735a4-e56b-4709-8e9d-ae9fcca5d4e6"
        );
    }

    #[test]
    fn test_roundtrip_serde() {
        let text = "/planes/terrane/local/resourceGroups/rg1/providers/\
                    Terrane.Core/containers/frontend";
        let id: ResourceId = serde_json::from_value(text.into()).unwrap();
        assert_eq!(serde_json::to_value(&id).unwrap(), text);
    }
}
