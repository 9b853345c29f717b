//! Configuration objects as they are held by the object store.
//!
//! The manifest layout follows the familiar Kubernetes shape: `apiVersion`,
//! `kind`, `metadata`, a `spec` carrying the typed payload and a `status` with
//! an ordered list of conditions.

use std::fmt;
use std::sync::LazyLock;

use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, Utc};
use envoy_types::pb::google::protobuf::Any;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use validator::Validate;

use crate::xds::kinds::Kind;
use crate::xds::naming::{ResourceName, ResourceVersion};

/// API group/version written into every manifest.
pub const API_VERSION: &str = "envoy.projectcontour.io/v1alpha1";

/// Condition type owned by the reconciler.
pub const ACCEPTED_CONDITION: &str = "Accepted";

/// Lower-case RFC 1123 subdomain: dot-separated labels of alphanumerics and
/// '-', each starting and ending with an alphanumeric.
pub static DNS1123_SUBDOMAIN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?(\.[a-z0-9]([-a-z0-9]*[a-z0-9])?)*$").unwrap()
});

/// Address of an object in the store.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Validate)]
pub struct ObjectKey {
    pub kind: Kind,
    #[validate(
        length(min = 1, max = 253, message = "must be between 1 and 253 characters"),
        regex(
            path = "crate::kubernetes::object::DNS1123_SUBDOMAIN",
            message = "must be a lower case DNS-1123 subdomain"
        )
    )]
    pub namespace: String,
    #[validate(
        length(min = 1, max = 253, message = "must be between 1 and 253 characters"),
        regex(
            path = "crate::kubernetes::object::DNS1123_SUBDOMAIN",
            message = "must be a lower case DNS-1123 subdomain"
        )
    )]
    pub name: String,
}

impl ObjectKey {
    pub fn new(kind: Kind, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { kind, namespace: namespace.into(), name: name.into() }
    }

    /// Store key of the resource this object produces.
    pub fn resource_name(&self) -> ResourceName {
        ResourceName::new(&self.namespace, self.kind, &self.name)
    }

    /// Namespace and name must both be DNS-1123 subdomains.
    pub fn validate(&self) -> Result<(), String> {
        Validate::validate(self).map_err(|errors| {
            format!("invalid object key {self}: {}", crate::errors::Error::from(errors))
        })
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}/{}", self.kind, self.namespace, self.name)
    }
}

/// Object metadata. `uid`, `resource_version`, `generation` and
/// `creation_timestamp` are assigned by the store.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub namespace: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub uid: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub resource_version: String,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub generation: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_timestamp: Option<DateTime<Utc>>,
}

fn is_zero(value: &i64) -> bool {
    *value == 0
}

/// Typed payload: a protobuf type identifier plus the encoded message.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload {
    #[serde(rename = "type")]
    pub type_url: String,
    #[serde(with = "base64_bytes")]
    pub value: Vec<u8>,
}

impl Payload {
    pub fn new(type_url: impl Into<String>, value: Vec<u8>) -> Self {
        Self { type_url: type_url.into(), value }
    }

    pub fn to_any(&self) -> Any {
        Any { type_url: self.type_url.clone(), value: self.value.clone() }
    }
}

mod base64_bytes {
    use super::*;

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded.as_bytes()).map_err(serde::de::Error::custom)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

/// A named status condition.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub condition_type: String,
    pub status: ConditionStatus,
    #[serde(default)]
    pub observed_generation: i64,
    pub last_transition_time: DateTime<Utc>,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigStatus {
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl ConfigStatus {
    pub fn condition(&self, condition_type: &str) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.condition_type == condition_type)
    }

    pub fn accepted(&self) -> Option<AcceptanceCondition> {
        self.condition(ACCEPTED_CONDITION).and_then(AcceptanceCondition::from_condition)
    }

    /// Replaces the Accepted condition, leaving every other condition in place.
    pub fn set_accepted(&mut self, accepted: &AcceptanceCondition) {
        self.conditions.retain(|c| c.condition_type != ACCEPTED_CONDITION);
        self.conditions.push(accepted.to_condition());
    }
}

/// A configuration object of one of the served kinds.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigObject {
    pub api_version: String,
    pub kind: Kind,
    pub metadata: ObjectMeta,
    pub spec: Payload,
    #[serde(default)]
    pub status: ConfigStatus,
}

impl ConfigObject {
    pub fn new(kind: Kind, namespace: &str, name: &str, spec: Payload) -> Self {
        Self {
            api_version: API_VERSION.to_string(),
            kind,
            metadata: ObjectMeta {
                namespace: namespace.to_string(),
                name: name.to_string(),
                ..Default::default()
            },
            spec,
            status: ConfigStatus::default(),
        }
    }

    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(self.kind, &self.metadata.namespace, &self.metadata.name)
    }

    pub fn resource_name(&self) -> ResourceName {
        self.key().resource_name()
    }

    /// Identity and version tokens as recorded by the store.
    pub fn resource_version(&self) -> ResourceVersion {
        ResourceVersion::new(&self.metadata.uid, &self.metadata.resource_version)
    }
}

/// Reason recorded with the Accepted condition.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AcceptanceReason {
    Accepted,
    TypeAmbiguity,
    InvalidFormat,
    FailedValidation,
}

impl AcceptanceReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            AcceptanceReason::Accepted => "Accepted",
            AcceptanceReason::TypeAmbiguity => "TypeAmbiguity",
            AcceptanceReason::InvalidFormat => "InvalidFormat",
            AcceptanceReason::FailedValidation => "FailedValidation",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        [
            AcceptanceReason::Accepted,
            AcceptanceReason::TypeAmbiguity,
            AcceptanceReason::InvalidFormat,
            AcceptanceReason::FailedValidation,
        ]
        .into_iter()
        .find(|reason| reason.as_str() == value)
    }
}

impl fmt::Display for AcceptanceReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed view of the Accepted condition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AcceptanceCondition {
    pub accepted: bool,
    pub reason: AcceptanceReason,
    pub message: String,
    pub observed_generation: i64,
    pub transition_time: DateTime<Utc>,
}

impl AcceptanceCondition {
    pub fn accepted(observed_generation: i64, transition_time: DateTime<Utc>) -> Self {
        Self {
            accepted: true,
            reason: AcceptanceReason::Accepted,
            message: String::new(),
            observed_generation,
            transition_time,
        }
    }

    pub fn rejected(
        reason: AcceptanceReason,
        message: impl Into<String>,
        observed_generation: i64,
        transition_time: DateTime<Utc>,
    ) -> Self {
        Self {
            accepted: false,
            reason,
            message: message.into(),
            observed_generation,
            transition_time,
        }
    }

    /// Carries the previous transition time forward when acceptance did not flip.
    pub fn settle(mut self, previous: Option<&AcceptanceCondition>) -> Self {
        if let Some(previous) = previous {
            if previous.accepted == self.accepted {
                self.transition_time = previous.transition_time;
            }
        }
        self
    }

    pub fn to_condition(&self) -> Condition {
        Condition {
            condition_type: ACCEPTED_CONDITION.to_string(),
            status: if self.accepted { ConditionStatus::True } else { ConditionStatus::False },
            observed_generation: self.observed_generation,
            last_transition_time: self.transition_time,
            reason: self.reason.as_str().to_string(),
            message: self.message.clone(),
        }
    }

    pub fn from_condition(condition: &Condition) -> Option<Self> {
        if condition.condition_type != ACCEPTED_CONDITION {
            return None;
        }
        let accepted = match condition.status {
            ConditionStatus::True => true,
            ConditionStatus::False => false,
            ConditionStatus::Unknown => return None,
        };
        let reason = AcceptanceReason::parse(&condition.reason).unwrap_or(if accepted {
            AcceptanceReason::Accepted
        } else {
            AcceptanceReason::FailedValidation
        });
        Some(Self {
            accepted,
            reason,
            message: condition.message.clone(),
            observed_generation: condition.observed_generation,
            transition_time: condition.last_transition_time,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(seconds: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(seconds, 0).unwrap()
    }

    #[test]
    fn keys_map_to_resource_names() {
        let key = ObjectKey::new(Kind::Listener, "default", "foo");
        assert_eq!(key.resource_name().as_str(), "default/listener/foo");
        assert_eq!(key.to_string(), "Listener default/foo");
    }

    #[test]
    fn keys_must_be_dns_names() {
        assert!(ObjectKey::new(Kind::Listener, "default", "foo.bar-1").validate().is_ok());
        assert!(ObjectKey::new(Kind::Listener, "default", "Foo").validate().is_err());
        assert!(ObjectKey::new(Kind::Listener, "default", "a/b").validate().is_err());
        assert!(ObjectKey::new(Kind::Listener, "", "foo").validate().is_err());
        assert!(ObjectKey::new(Kind::Listener, "default", "-foo").validate().is_err());
        assert!(ObjectKey::new(Kind::Listener, "default", "foo..bar").validate().is_err());

        let longest = "a".repeat(253);
        assert!(ObjectKey::new(Kind::Listener, "default", longest.as_str()).validate().is_ok());
        let error = ObjectKey::new(Kind::Listener, "default", "a".repeat(254)).validate().unwrap_err();
        assert!(error.contains("between 1 and 253"), "{error}");
    }

    #[test]
    fn manifests_round_trip_through_yaml() {
        let mut object = ConfigObject::new(
            Kind::Cluster,
            "default",
            "backend",
            Payload::new("type.googleapis.com/envoy.config.cluster.v3.Cluster", vec![10, 1, 97]),
        );
        object.status.set_accepted(&AcceptanceCondition::accepted(1, at(10)));

        let yaml = serde_yaml::to_string(&object).unwrap();
        assert!(yaml.contains("apiVersion: envoy.projectcontour.io/v1alpha1"));
        assert!(yaml.contains("value: CgFh"));

        let parsed: ConfigObject = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed, object);
    }

    #[test]
    fn setting_accepted_preserves_other_conditions() {
        let ready = Condition {
            condition_type: "Ready".to_string(),
            status: ConditionStatus::True,
            observed_generation: 1,
            last_transition_time: at(1),
            reason: "Synced".to_string(),
            message: String::new(),
        };
        let mut status = ConfigStatus { conditions: vec![ready.clone()] };

        status.set_accepted(&AcceptanceCondition::accepted(1, at(2)));
        status.set_accepted(&AcceptanceCondition::rejected(
            AcceptanceReason::InvalidFormat,
            "bad bytes",
            2,
            at(3),
        ));

        assert_eq!(status.conditions.len(), 2);
        assert_eq!(status.conditions[0], ready);
        let accepted = status.accepted().unwrap();
        assert!(!accepted.accepted);
        assert_eq!(accepted.reason, AcceptanceReason::InvalidFormat);
        assert_eq!(accepted.observed_generation, 2);
    }

    #[test]
    fn transition_time_only_moves_when_acceptance_flips() {
        let previous = AcceptanceCondition::accepted(1, at(100));

        let still_accepted = AcceptanceCondition::accepted(2, at(200)).settle(Some(&previous));
        assert_eq!(still_accepted.transition_time, at(100));
        assert_eq!(still_accepted.observed_generation, 2);

        let rejected = AcceptanceCondition::rejected(AcceptanceReason::TypeAmbiguity, "x", 3, at(300))
            .settle(Some(&previous));
        assert_eq!(rejected.transition_time, at(300));
    }
}
