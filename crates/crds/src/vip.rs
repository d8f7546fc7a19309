//! Vip CRD
//!
//! Records a virtual IP request for a load-balanced Service. The
//! load-balancer controller creates one per Service, the IPAM controller
//! fills in `spec.ipaddress`.
//!
//! The object carries a `description` next to `spec`, which
//! `#[derive(CustomResource)]` cannot express, so `kube::Resource` is
//! implemented by hand.

use std::borrow::Cow;
use std::net::IpAddr;

use k8s_openapi::NamespaceResourceScope;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::Resource;
use serde::{Deserialize, Serialize};

/// API group of the Vip resource.
pub const GROUP: &str = "ipam.citrix.com";
/// API version of the Vip resource.
pub const VERSION: &str = "v1";
/// Kind of the Vip resource.
pub const KIND: &str = "Vip";
/// Plural resource name used in API paths.
pub const PLURAL: &str = "vips";
/// Service annotation that publishes the assigned address.
pub const VIP_ANNOTATION_KEY: &str = "com.citrix.vip";

fn default_api_version() -> String {
    format!("{GROUP}/{VERSION}")
}

fn default_kind() -> String {
    KIND.to_string()
}

/// A Vip custom resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Vip {
    /// Always `ipam.citrix.com/v1`
    #[serde(default = "default_api_version")]
    pub api_version: String,

    /// Always `Vip`
    #[serde(default = "default_kind")]
    pub kind: String,

    /// Standard object metadata
    #[serde(default)]
    pub metadata: ObjectMeta,

    /// Free-form description of the request
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Requested and assigned state
    pub spec: VipSpec,
}

/// Spec of a [`Vip`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VipSpec {
    /// Name of the Service this VIP belongs to (same namespace)
    pub service: String,

    /// Free-form description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Assigned address, set by the IPAM controller
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipaddress: Option<String>,
}

impl Vip {
    /// Creates a Vip with the given name and spec.
    pub fn new(name: &str, spec: VipSpec) -> Self {
        Self {
            api_version: default_api_version(),
            kind: default_kind(),
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            description: None,
            spec,
        }
    }

    /// Builds the Vip requested on behalf of a Service.
    ///
    /// The Vip is named after the Service, so there is at most one per
    /// Service and it can be found again without a lookup table.
    pub fn for_service(namespace: &str, service: &str) -> Self {
        let mut vip = Self::new(
            service,
            VipSpec {
                service: service.to_string(),
                description: Some(format!("VIP for the {service} Service")),
                ipaddress: None,
            },
        );
        vip.metadata.namespace = Some(namespace.to_string());
        vip.description = Some(format!("VIP for {service} service"));
        vip
    }

    /// Raw `spec.ipaddress`, with empty strings treated as unset.
    pub fn ipaddress(&self) -> Option<&str> {
        self.spec
            .ipaddress
            .as_deref()
            .map(str::trim)
            .filter(|ip| !ip.is_empty())
    }

    /// Parsed `spec.ipaddress`. Unparseable values count as no address.
    pub fn address(&self) -> Option<IpAddr> {
        self.ipaddress().and_then(|ip| ip.parse().ok())
    }
}

impl Resource for Vip {
    type DynamicType = ();
    type Scope = NamespaceResourceScope;

    fn kind(_: &()) -> Cow<'_, str> {
        Cow::Borrowed(KIND)
    }

    fn group(_: &()) -> Cow<'_, str> {
        Cow::Borrowed(GROUP)
    }

    fn version(_: &()) -> Cow<'_, str> {
        Cow::Borrowed(VERSION)
    }

    fn plural(_: &()) -> Cow<'_, str> {
        Cow::Borrowed(PLURAL)
    }

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

/// Builds the `CustomResourceDefinition` manifest for [`Vip`].
///
/// The root schema lists `description` explicitly so the API server does
/// not prune it.
pub fn vip_crd() -> Result<CustomResourceDefinition, serde_json::Error> {
    serde_json::from_value(serde_json::json!({
        "apiVersion": "apiextensions.k8s.io/v1",
        "kind": "CustomResourceDefinition",
        "metadata": { "name": format!("{PLURAL}.{GROUP}") },
        "spec": {
            "group": GROUP,
            "scope": "Namespaced",
            "names": {
                "kind": KIND,
                "plural": PLURAL,
                "singular": "vip",
                "listKind": "VipList",
            },
            "versions": [{
                "name": VERSION,
                "served": true,
                "storage": true,
                "additionalPrinterColumns": [
                    { "name": "Service", "type": "string", "jsonPath": ".spec.service" },
                    { "name": "Address", "type": "string", "jsonPath": ".spec.ipaddress" },
                ],
                "schema": {
                    "openAPIV3Schema": {
                        "type": "object",
                        "required": ["spec"],
                        "properties": {
                            "description": { "type": "string" },
                            "spec": {
                                "type": "object",
                                "required": ["service"],
                                "properties": {
                                    "service": { "type": "string" },
                                    "description": { "type": "string" },
                                    "ipaddress": { "type": "string" },
                                },
                            },
                        },
                    },
                },
            }],
        },
    }))
}
