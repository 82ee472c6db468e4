//! Inbound webhook payload shapes
//!
//! Clients have sent three shapes over time. Each is matched structurally and
//! mapped to a [`CanonicalRecord`]; validation happens later, in admission.

use serde::Deserialize;

use crate::admission::CanonicalRecord;
use crate::persistence::NO_WORKFLOW;

/// Any accepted inbound payload
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum InboundPayload {
    /// Custom action: identifiers in `extras`, optionally data in `data`
    CustomAction(CustomActionPayload),
    /// Original flat shape
    Direct(DirectPayload),
}

/// Recognized custom action keys
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum ActionKey {
    #[serde(rename = "humanizer_drip")]
    Drip,
    #[serde(rename = "humanizer_v1")]
    V1,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ActionMeta {
    pub key: ActionKey,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionExtras {
    pub contact_id: Option<String>,
    pub location_id: Option<String>,
    pub workflow_id: Option<String>,
    #[serde(rename = "TimeFrame")]
    pub time_frame: Option<String>,
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionData {
    #[serde(rename = "TimeFrame")]
    pub time_frame: Option<String>,
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomActionPayload {
    pub extras: ActionExtras,
    pub meta: ActionMeta,
    #[serde(default)]
    pub data: Option<ActionData>,
    /// Marketplace actions carry the delay range and credential in `data`
    #[serde(default)]
    pub is_marketplace_action: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct IdRef {
    pub id: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CustomData {
    #[serde(rename = "TimeFrame")]
    pub time_frame: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectPayload {
    #[serde(rename = "contact_id")]
    pub contact_id: Option<String>,
    pub location: Option<IdRef>,
    pub workflow: Option<IdRef>,
    pub custom_data: Option<CustomData>,
    #[serde(rename = "api_key")]
    pub api_key: Option<String>,
}

fn workflow_or_default(workflow_id: Option<String>) -> Option<String> {
    Some(
        workflow_id
            .filter(|w| !w.is_empty())
            .unwrap_or_else(|| NO_WORKFLOW.to_string()),
    )
}

impl InboundPayload {
    /// Map to the canonical admission record
    pub fn normalize(self) -> CanonicalRecord {
        match self {
            InboundPayload::CustomAction(action) => {
                let CustomActionPayload {
                    extras,
                    data,
                    is_marketplace_action,
                    ..
                } = action;

                match data {
                    Some(data) if is_marketplace_action => CanonicalRecord {
                        subject_id: extras.contact_id,
                        tenant_id: extras.location_id,
                        workflow_id: workflow_or_default(extras.workflow_id),
                        delay_range: data.time_frame,
                        credential: data.api_key,
                    },
                    data => CanonicalRecord {
                        subject_id: extras.contact_id,
                        tenant_id: extras.location_id,
                        workflow_id: workflow_or_default(extras.workflow_id),
                        delay_range: extras.time_frame,
                        credential: extras.api_key.or(data.and_then(|d| d.api_key)),
                    },
                }
            }
            InboundPayload::Direct(direct) => CanonicalRecord {
                subject_id: direct.contact_id,
                tenant_id: direct.location.and_then(|l| l.id),
                workflow_id: workflow_or_default(direct.workflow.and_then(|w| w.id)),
                delay_range: direct.custom_data.and_then(|c| c.time_frame),
                credential: direct.api_key,
            },
        }
    }
}

/// Parse a JSON body and normalize it in one step
pub fn normalize(body: serde_json::Value) -> Result<CanonicalRecord, serde_json::Error> {
    Ok(serde_json::from_value::<InboundPayload>(body)?.normalize())
}
