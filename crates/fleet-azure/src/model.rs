//! ARM JSON mapping
//!
//! Pure conversions between Azure Resource Manager payloads and the
//! orchestrator's scale-set types. Nothing here performs I/O.

use serde::Deserialize;
use serde_json::{json, Map, Value};

use fleet_common::{Error, Result};
use fleet_upgrade::{BootScript, ImageReference, OperationStatus, ScaleSet, TargetModel, VmInstance};

/// Tag carrying the identity of the boot script pushed to a scale set
///
/// ARM never returns protected extension settings, so the hash is the only
/// way to tell which script a scale set runs.
pub const SCRIPT_HASH_TAG: &str = "fleet-script-hash";

/// Name of the custom-script extension that runs the boot script
pub const BOOT_EXTENSION: &str = "cse";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ArmScaleSet {
    #[serde(default)]
    sku: ArmSku,
    #[serde(default)]
    tags: Map<String, Value>,
    #[serde(default)]
    properties: ArmScaleSetProperties,
}

#[derive(Debug, Default, Deserialize)]
struct ArmSku {
    name: Option<String>,
    #[serde(default)]
    capacity: u32,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ArmScaleSetProperties {
    virtual_machine_profile: Option<ArmVmProfile>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ArmVmProfile {
    storage_profile: Option<ArmStorageProfile>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ArmStorageProfile {
    image_reference: Option<ImageReference>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ArmInstancePage {
    #[serde(default)]
    value: Vec<ArmInstance>,
    next_link: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ArmInstance {
    instance_id: String,
    #[serde(default)]
    properties: ArmInstanceProperties,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ArmInstanceProperties {
    #[serde(default)]
    latest_model_applied: bool,
    os_profile: Option<ArmOsProfile>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ArmOsProfile {
    computer_name: Option<String>,
}

/// One page of a scale set's VM listing
#[derive(Debug, PartialEq)]
pub struct InstancePage {
    /// VMs on this page
    pub instances: Vec<VmInstance>,
    /// Absolute URL of the next page
    pub next_link: Option<String>,
}

/// Parse a `GET virtualMachineScaleSets/{name}` response
pub fn parse_scale_set(name: &str, body: Value) -> Result<ScaleSet> {
    let arm: ArmScaleSet = serde_json::from_value(body)
        .map_err(|e| Error::cloud_permanent(name, format!("unexpected scale set payload: {e}")))?;

    let image = arm
        .properties
        .virtual_machine_profile
        .and_then(|p| p.storage_profile)
        .and_then(|s| s.image_reference)
        .filter(|i| !i.is_empty());
    let script = arm
        .tags
        .get(SCRIPT_HASH_TAG)
        .and_then(Value::as_str)
        .map(|hash| BootScript {
            hash: hash.to_string(),
            settings: Value::Null,
        });

    Ok(ScaleSet {
        name: name.to_string(),
        capacity: arm.sku.capacity,
        model: TargetModel {
            image,
            script,
            vm_size: arm.sku.name,
        },
    })
}

/// Parse one page of `GET virtualMachineScaleSets/{name}/virtualMachines`
///
/// VMs without an OS profile have not finished provisioning; their hostname
/// is left empty so readiness checks treat them as not ready.
pub fn parse_instance_page(scale_set: &str, body: Value) -> Result<InstancePage> {
    let page: ArmInstancePage = serde_json::from_value(body)
        .map_err(|e| Error::cloud_permanent(scale_set, format!("unexpected instance list payload: {e}")))?;

    let instances = page
        .value
        .into_iter()
        .map(|vm| VmInstance {
            instance_id: vm.instance_id,
            computer_name: vm
                .properties
                .os_profile
                .and_then(|p| p.computer_name)
                .unwrap_or_default(),
            latest_model_applied: vm.properties.latest_model_applied,
        })
        .collect();

    Ok(InstancePage {
        instances,
        next_link: page.next_link.filter(|l| !l.is_empty()),
    })
}

/// PATCH body replacing the scale-set model
///
/// Only the parts the target sets are sent; ARM merges the rest.
pub fn model_patch(model: &TargetModel) -> Value {
    let mut body = Map::new();
    let mut profile = Map::new();

    if let Some(size) = &model.vm_size {
        body.insert("sku".to_string(), json!({ "name": size }));
    }
    if let Some(image) = model.image.as_ref().filter(|i| !i.is_empty()) {
        profile.insert(
            "storageProfile".to_string(),
            json!({ "imageReference": image_reference(image) }),
        );
    }
    if let Some(script) = &model.script {
        profile.insert(
            "extensionProfile".to_string(),
            json!({
                "extensions": [{
                    "name": BOOT_EXTENSION,
                    "properties": { "protectedSettings": script.settings },
                }]
            }),
        );
        body.insert("tags".to_string(), json!({ SCRIPT_HASH_TAG: script.hash }));
    }
    if !profile.is_empty() {
        body.insert(
            "properties".to_string(),
            json!({ "virtualMachineProfile": Value::Object(profile) }),
        );
    }

    Value::Object(body)
}

/// ARM spelling of an image reference: a custom image ID or a marketplace
/// publisher/offer/sku/version tuple, never both
fn image_reference(image: &ImageReference) -> Value {
    if let Some(id) = &image.id {
        return json!({ "id": id });
    }
    let mut reference = Map::new();
    for (key, value) in [
        ("publisher", &image.publisher),
        ("offer", &image.offer),
        ("sku", &image.sku),
        ("version", &image.version),
    ] {
        if let Some(value) = value {
            reference.insert(key.to_string(), Value::String(value.clone()));
        }
    }
    Value::Object(reference)
}

/// PATCH body setting the absolute capacity
pub fn capacity_patch(capacity: u32) -> Value {
    json!({ "sku": { "capacity": capacity } })
}

/// POST body naming a single VM
pub fn instance_ids(instance_id: &str) -> Value {
    json!({ "instanceIds": [instance_id] })
}

/// Interpret a long-running-operation poll response
///
/// `Azure-AsyncOperation` endpoints return a `status` field; `Location`
/// endpoints answer 202 while running and 200/204 once done.
pub fn parse_operation_status(http_status: u16, body: &Value) -> OperationStatus {
    match body.get("status").and_then(Value::as_str) {
        Some("Succeeded") => OperationStatus::Succeeded,
        Some("Failed") | Some("Canceled") => {
            let message = body
                .pointer("/error/message")
                .and_then(Value::as_str)
                .unwrap_or("operation failed without an error message");
            OperationStatus::Failed(message.to_string())
        }
        Some(_) => OperationStatus::InProgress,
        None if http_status == 202 => OperationStatus::InProgress,
        None => OperationStatus::Succeeded,
    }
}

/// Extract the message of an ARM error response
pub fn error_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.pointer("/error/message").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| body.trim().to_string())
}
