//! Admission decision for the CA certificates volume.
//!
//! Everything here is a pure function of the admission request, so it can be
//! exercised without a cluster.

use json_patch::{AddOperation, Patch, PatchOperation};
use k8s_openapi::api::core::v1::{Pod, PodSpec};
use kube::core::{
    admission::{AdmissionRequest, AdmissionResponse},
    DynamicObject,
};
use serde_json::{json, Value};

use super::Error;

/// Pods opt in by carrying this label with the value [`OPT_IN_LABEL_VALUE`]
pub const OPT_IN_LABEL_KEY: &str = "spiffe.io/spire-managed-identity";
pub const OPT_IN_LABEL_VALUE: &str = "true";

pub const CA_VOLUME_NAME: &str = "cacerts";
pub const CSI_DRIVER_NAME: &str = "cacerts.csi.cert-manager.io";
pub const CA_CERTS_MOUNT_PATH: &str = "/etc/ssl/certs";

pub fn is_opted_in(pod: &Pod) -> bool {
    pod.metadata
        .labels
        .as_ref()
        .and_then(|labels| labels.get(OPT_IN_LABEL_KEY))
        .map_or(false, |value| value == OPT_IN_LABEL_VALUE)
}

fn add(path: String, value: Value) -> PatchOperation {
    PatchOperation::Add(AddOperation { path, value })
}

fn ca_volume() -> Value {
    json!({
        "name": CA_VOLUME_NAME,
        "csi": {
            "driver": CSI_DRIVER_NAME,
            "readOnly": true,
            "volumeAttributes": {
                "os": "alpine",
                "caProviderClasses": crate::types::provider::CA_PROVIDER_NAME,
            },
        },
    })
}

fn ca_volume_mount() -> Value {
    json!({
        "name": CA_VOLUME_NAME,
        "mountPath": CA_CERTS_MOUNT_PATH,
        "readOnly": true,
    })
}

/// JSON patch attaching the CA volume to the pod and mounting it in every container.
///
/// `add` cannot append to a missing array, so an empty array is added first
/// wherever the pod has none.
pub fn ca_volume_patch(pod: &Pod) -> Patch {
    let default_spec = PodSpec::default();
    let spec = pod.spec.as_ref().unwrap_or(&default_spec);
    let mut ops = Vec::with_capacity(2 + 2 * spec.containers.len());

    if spec.volumes.is_none() {
        ops.push(add("/spec/volumes".to_string(), json!([])));
    }
    ops.push(add("/spec/volumes/-".to_string(), ca_volume()));

    for (i, container) in spec.containers.iter().enumerate() {
        if container.volume_mounts.is_none() {
            ops.push(add(format!("/spec/containers/{}/volumeMounts", i), json!([])));
        }
        ops.push(add(
            format!("/spec/containers/{}/volumeMounts/-", i),
            ca_volume_mount(),
        ));
    }

    Patch(ops)
}

fn decode_pod(req: &AdmissionRequest<DynamicObject>) -> Result<Pod, Error> {
    let object = req.object.as_ref().ok_or(Error::MissingObject)?;
    let value = serde_json::to_value(object).map_err(Error::DecodePod)?;
    serde_json::from_value(value).map_err(Error::DecodePod)
}

fn try_mutate(req: &AdmissionRequest<DynamicObject>) -> Result<AdmissionResponse, Error> {
    let pod = decode_pod(req)?;
    let resp: AdmissionResponse = req.into();

    if !is_opted_in(&pod) {
        tracing::debug!(name = %req.name, namespace = ?req.namespace, "pod has not opted in, skipping");
        return Ok(resp);
    }

    let patch = ca_volume_patch(&pod);
    tracing::info!(name = %req.name, namespace = ?req.namespace, ops = patch.0.len(), "patching pod");
    resp.with_patch(patch).map_err(Error::SerializePatch)
}

/// Decide on a pod admission request.
///
/// Pods without the opt-in label are allowed untouched. The request is only
/// refused when the pod cannot be decoded or the patch cannot be serialized.
pub fn mutate(req: &AdmissionRequest<DynamicObject>) -> AdmissionResponse {
    match try_mutate(req) {
        Ok(resp) => resp,
        Err(error) => {
            tracing::error!(name = %req.name, namespace = ?req.namespace, %error, "failed to mutate");
            AdmissionResponse::from(req).deny(error.to_string())
        }
    }
}
