//! Status write-back to Gateway API resources
//!
//! Conditions are merged into `status.conditions` on the origin resource and
//! written with a JSON merge patch. A write is skipped when an identical
//! condition is already present on the object.

use async_trait::async_trait;
use k8s_openapi::chrono::{SecondsFormat, Utc};
use kube::api::{Api, ApiResource, DynamicObject, Patch, PatchParams};
use kube::Client;
use serde_json::{json, Value};
use tracing::debug;

use lbsync_common::{ChangeKey, Error, ResourceType, Result, FIELD_MANAGER};
use lbsync_pipeline::{StatusCondition, StatusWriter};

use crate::gateway::{Gateway, HasApiResource, HttpRoute};

/// Writes conditions onto Gateways and HTTPRoutes
pub struct KubeStatusWriter {
    client: Client,
}

impl KubeStatusWriter {
    /// Create a writer using the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl StatusWriter for KubeStatusWriter {
    async fn write(&self, key: &ChangeKey, condition: &StatusCondition) -> Result<()> {
        let ar: ApiResource = match key.resource_type() {
            ResourceType::Gateway => Gateway::api_resource(),
            ResourceType::HttpRoute => HttpRoute::api_resource(),
            other => {
                debug!(key = %key, resource_type = %other.as_str(), "no status for resource type");
                return Ok(());
            }
        };
        let Some(namespace) = key.namespace() else {
            return Ok(());
        };

        let api: Api<DynamicObject> = Api::namespaced_with(self.client.clone(), namespace, &ar);
        let Some(object) = api.get_opt(key.name()).await? else {
            debug!(key = %key, "origin resource is gone, dropping status");
            return Ok(());
        };

        let existing = object
            .data
            .pointer("/status/conditions")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        let Some(conditions) = merge_condition(&existing, condition, &now)? else {
            debug!(key = %key, reason = %condition.reason, "condition already present");
            return Ok(());
        };

        let patch = json!({ "status": { "conditions": conditions } });
        match api
            .patch_status(key.name(), &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(Error::status(key, e.to_string())),
        }
    }
}

/// Merge `condition` into `existing` conditions.
///
/// Returns `None` when a condition of the same type with the same status,
/// reason, message and observed generation is already present.
/// `lastTransitionTime` only moves when the status value changes.
pub fn merge_condition(
    existing: &[Value],
    condition: &StatusCondition,
    now: &str,
) -> Result<Option<Vec<Value>>> {
    let mut desired = serde_json::to_value(condition)?;
    let position = existing
        .iter()
        .position(|c| c.get("type").and_then(Value::as_str) == Some(condition.type_.as_str()));

    let mut transition = Value::String(now.to_string());
    if let Some(current) = position.map(|i| &existing[i]) {
        let same_status = current.get("status") == desired.get("status");
        let unchanged = same_status
            && current.get("reason") == desired.get("reason")
            && current.get("message") == desired.get("message")
            && current.get("observedGeneration") == desired.get("observedGeneration");
        if unchanged {
            return Ok(None);
        }
        if same_status {
            if let Some(time) = current.get("lastTransitionTime") {
                transition = time.clone();
            }
        }
    }

    if let Some(fields) = desired.as_object_mut() {
        fields.insert("lastTransitionTime".to_string(), transition);
    }

    let mut merged = existing.to_vec();
    match position {
        Some(i) => merged[i] = desired,
        None => merged.push(desired),
    }
    Ok(Some(merged))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    const EARLIER: &str = "2026-01-01T00:00:00Z";
    const NOW: &str = "2026-01-02T00:00:00Z";

    fn programmed(status: &str, reason: &str, generation: i64) -> Value {
        json!({
            "type": "Programmed",
            "status": status,
            "reason": reason,
            "message": "Configuration synchronized to the load balancer",
            "observedGeneration": generation,
            "lastTransitionTime": EARLIER,
        })
    }

    fn accepted() -> Value {
        json!({"type": "Accepted", "status": "True", "reason": "Accepted", "message": ""})
    }

    /// Story: re-applying the condition already on the object writes nothing
    #[test]
    fn story_identical_condition_is_skipped() {
        let existing = vec![accepted(), programmed("True", "Synced", 3)];
        let merged = merge_condition(&existing, &StatusCondition::synced(Some(3)), NOW).unwrap();
        assert!(merged.is_none());
    }

    #[rstest]
    #[case::new_generation(StatusCondition::synced(Some(4)), EARLIER)]
    #[case::status_flip(StatusCondition::sync_failed("boom", Some(3)), NOW)]
    fn changed_condition_replaces_existing(
        #[case] condition: StatusCondition,
        #[case] expected_transition: &str,
    ) {
        let existing = vec![accepted(), programmed("True", "Synced", 3)];
        let merged = merge_condition(&existing, &condition, NOW).unwrap().unwrap();

        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0], accepted(), "other condition types are untouched");
        assert_eq!(merged[1]["reason"], condition.reason.as_str());
        assert_eq!(merged[1]["lastTransitionTime"], expected_transition);
    }

    #[test]
    fn missing_condition_is_appended() {
        let merged = merge_condition(&[accepted()], &StatusCondition::pending("retrying", None), NOW)
            .unwrap()
            .unwrap();
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[1]["status"], "False");
        assert_eq!(merged[1]["lastTransitionTime"], NOW);
        assert!(merged[1].get("observedGeneration").is_none());
    }
}
