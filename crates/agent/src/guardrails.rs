use std::collections::BTreeSet;

use ragway_core::domain::collection::CollectionVersion;
use ragway_core::domain::tool::{Permission, ToolDescriptor};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GuardrailDecision {
    Allow,
    Deny { reason_code: &'static str, message: String },
}

impl GuardrailDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow)
    }
}

/// A tool is usable only when the pinned collection version allow-lists it
/// and the caller holds every permission the tool declares.
pub fn evaluate_tool_access(
    descriptor: &ToolDescriptor,
    version: &CollectionVersion,
    granted: &BTreeSet<Permission>,
) -> GuardrailDecision {
    if !version.allows_tool(&descriptor.tool_id) {
        return GuardrailDecision::Deny {
            reason_code: "tool_not_allowed_for_collection",
            message: format!(
                "tool `{}` is not enabled for collection `{}` version {}",
                descriptor.tool_id, version.collection_id, version.version_number
            ),
        };
    }

    let missing: Vec<&str> = descriptor
        .required_permissions
        .difference(granted)
        .map(|permission| permission.0.as_str())
        .collect();
    if !missing.is_empty() {
        return GuardrailDecision::Deny {
            reason_code: "missing_permissions",
            message: format!(
                "tool `{}` requires permissions the caller lacks: {}",
                descriptor.tool_id,
                missing.join(", ")
            ),
        };
    }

    GuardrailDecision::Allow
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use chrono::Utc;
    use ragway_core::domain::collection::{CollectionConfig, CollectionId, CollectionVersion};
    use ragway_core::domain::tool::{Permission, ToolDescriptor};
    use serde_json::json;

    use super::{evaluate_tool_access, GuardrailDecision};

    fn version(tools: &[&str]) -> CollectionVersion {
        let config = tools
            .iter()
            .fold(CollectionConfig::new("nomic-embed-text"), |config, tool| config.with_tool(*tool));
        CollectionVersion {
            collection_id: CollectionId("kb".to_owned()),
            version_number: 2,
            config,
            published_at: Utc::now(),
        }
    }

    #[test]
    fn allow_listed_tool_with_permissions_is_allowed() {
        let descriptor =
            ToolDescriptor::new("ticket_lookup", json!({})).with_permission("tickets.read");
        let granted = BTreeSet::from([Permission("tickets.read".to_owned())]);

        let decision = evaluate_tool_access(&descriptor, &version(&["ticket_lookup"]), &granted);

        assert_eq!(decision, GuardrailDecision::Allow);
    }

    #[test]
    fn tool_missing_from_allow_list_is_denied() {
        let descriptor = ToolDescriptor::new("web_search", json!({}));

        let decision =
            evaluate_tool_access(&descriptor, &version(&["ticket_lookup"]), &BTreeSet::new());

        let reason_code = match decision {
            GuardrailDecision::Deny { reason_code, .. } => reason_code,
            GuardrailDecision::Allow => "",
        };
        assert_eq!(reason_code, "tool_not_allowed_for_collection");
    }

    #[test]
    fn missing_permission_is_named_in_denial() {
        let descriptor = ToolDescriptor::new("ticket_update", json!({}))
            .with_permission("tickets.read")
            .with_permission("tickets.write");
        let granted = BTreeSet::from([Permission("tickets.read".to_owned())]);

        let decision = evaluate_tool_access(&descriptor, &version(&["ticket_update"]), &granted);

        let (reason_code, message) = match decision {
            GuardrailDecision::Deny { reason_code, message } => (reason_code, message),
            GuardrailDecision::Allow => ("", String::new()),
        };
        assert_eq!(reason_code, "missing_permissions");
        assert!(message.contains("tickets.write"));
        assert!(!message.contains("tickets.read,"));
    }
}
