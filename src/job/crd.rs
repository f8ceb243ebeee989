//! The MapReduceJob custom resource and its CRD-backed client.
//!
//! The resource predates structural schemas: `status`, `maps`, `reduces` and
//! `results` sit at the top level of the object rather than under a status
//! subresource, so the CRD is declared with unknown fields preserved and the
//! client goes through [`DynamicObject`] instead of a typed derive.

use std::collections::HashSet;

use anyhow::{Context, Result};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::{
    CustomResourceDefinition, CustomResourceDefinitionNames, CustomResourceDefinitionSpec,
    CustomResourceDefinitionVersion, CustomResourceValidation, JSONSchemaProps,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Patch as KubePatch, PatchParams};
use kube::core::{ApiResource, DynamicObject, GroupVersionKind};
use kube::{Api, ResourceExt};

use crate::job::MapReduceJob;
use crate::jsonpatch::Patch;

pub const GROUP: &str = "turbobytes.com";
pub const VERSION: &str = "v1beta1";
pub const KIND: &str = "MapReduceJob";
pub const PLURAL: &str = "mapreducejobs";

pub fn crd_name() -> String {
    format!("{PLURAL}.{GROUP}")
}

pub fn api_resource() -> ApiResource {
    ApiResource::from_gvk_with_plural(&GroupVersionKind::gvk(GROUP, VERSION, KIND), PLURAL)
}

/// The definition the operator installs when it is missing.
pub fn crd() -> CustomResourceDefinition {
    CustomResourceDefinition {
        metadata: ObjectMeta {
            name: Some(crd_name()),
            ..Default::default()
        },
        spec: CustomResourceDefinitionSpec {
            group: GROUP.to_string(),
            scope: "Namespaced".to_string(),
            names: CustomResourceDefinitionNames {
                plural: PLURAL.to_string(),
                singular: Some("mapreducejob".to_string()),
                kind: KIND.to_string(),
                short_names: Some(vec!["mrj".to_string()]),
                ..Default::default()
            },
            versions: vec![CustomResourceDefinitionVersion {
                name: VERSION.to_string(),
                served: true,
                storage: true,
                schema: Some(CustomResourceValidation {
                    open_api_v3_schema: Some(JSONSchemaProps {
                        type_: Some("object".to_string()),
                        x_kubernetes_preserve_unknown_fields: Some(true),
                        ..Default::default()
                    }),
                }),
                ..Default::default()
            }],
            ..Default::default()
        },
        status: None,
    }
}

/// Converts a watched object into the typed document. Events that fail here
/// are skipped by the consumer, never fatal.
pub fn from_dynamic(obj: &DynamicObject) -> Result<MapReduceJob> {
    let mut job: MapReduceJob = serde_json::from_value(obj.data.clone())
        .with_context(|| format!("unmarshaling {}", obj.name_any()))?;
    job.name = obj.name_any();
    job.namespace = obj.metadata.namespace.clone().unwrap_or_default();
    Ok(job)
}

/// Client for MapReduceJob resources; all mutations are JSON-patch CAS.
#[derive(Clone)]
pub struct JobClient {
    client: kube::Client,
}

impl JobClient {
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }

    fn api(&self, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, &api_resource())
    }

    /// Cluster-wide view, used by the watch and by GC.
    pub fn all(&self) -> Api<DynamicObject> {
        Api::all_with(self.client.clone(), &api_resource())
    }

    pub async fn get(&self, name: &str, namespace: &str) -> Result<MapReduceJob> {
        let obj = self
            .api(namespace)
            .get(name)
            .await
            .with_context(|| format!("fetching job {namespace}/{name}"))?;
        from_dynamic(&obj)
    }

    /// Submits a CAS document. An error usually means a failed `test` op,
    /// i.e. somebody else got there first; callers decide whether that is
    /// interesting.
    pub async fn patch(&self, name: &str, namespace: &str, patch: &Patch) -> Result<()> {
        self.api(namespace)
            .patch(name, &PatchParams::default(), &KubePatch::Json::<()>(patch.build()?))
            .await
            .with_context(|| format!("patching {namespace}/{name}"))?;
        Ok(())
    }

    /// Names of every live job across all namespaces.
    pub async fn live_names(&self) -> Result<HashSet<String>> {
        let list = self.all().list(&Default::default()).await?;
        Ok(list.items.iter().map(|o| o.name_any()).collect())
    }
}
