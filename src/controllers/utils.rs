/*
* File: src/controllers/utils.rs
*
* Common utility functions shared by both controllers: the status condition
* ledger and the label/selector derivation used to mark and query owned
* sub-resources. Consolidating reusable logic here keeps the individual
* controller files focused on their reconciliation logic.
*
* SPDX-License-Identifier: Apache-2.0
*/

use std::collections::BTreeMap;

use crate::crds::Condition;

// Standard recommended labels stamped onto every sub-resource.
pub const LABEL_KEY_NAME: &str = "app.kubernetes.io/name";
pub const LABEL_KEY_INSTANCE: &str = "app.kubernetes.io/instance";
pub const LABEL_KEY_PART_OF: &str = "app.kubernetes.io/part-of";
pub const LABEL_KEY_MANAGED_BY: &str = "app.kubernetes.io/managed-by";

pub const LABEL_MANAGED_BY: &str = "mis-operator";
pub const MODEL_LABEL_PART_OF: &str = "mis-model";
pub const SERVICE_LABEL_PART_OF: &str = "mis-service";

/// Upsert a condition into an ordered condition list, replacing any existing
/// entry of the same type. The transition timestamp is preserved when the
/// boolean status did not change.
pub fn set_condition(conditions: &mut Vec<Condition>, condition: Condition) {
    match conditions.iter_mut().find(|c| c.type_ == condition.type_) {
        Some(existing) => {
            let unchanged = existing.status == condition.status;
            let previous_transition = existing.last_transition_time.clone();
            *existing = condition;
            if unchanged {
                existing.last_transition_time = previous_transition;
            }
        }
        None => conditions.push(condition),
    }
}

/// Full label set stamped onto sub-resources owned by a CachedModel or an
/// InferenceService. `part_of` distinguishes the two resource families.
pub fn standard_labels(name: &str, part_of: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (LABEL_KEY_NAME.to_string(), name.to_string()),
        (LABEL_KEY_INSTANCE.to_string(), name.to_string()),
        (LABEL_KEY_PART_OF.to_string(), part_of.to_string()),
        (LABEL_KEY_MANAGED_BY.to_string(), LABEL_MANAGED_BY.to_string()),
    ])
}

/// Selector labels matching the serving pods of one InferenceService. Kept
/// deliberately small so the Service keeps selecting pods across job
/// replacements.
pub fn service_selector_labels(name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([(SERVICE_LABEL_PART_OF.to_string(), name.to_string())])
}

/// The selector string published in `status.selector` for scale consumers.
pub fn service_selector_string(name: &str) -> String {
    format!("{}={}", SERVICE_LABEL_PART_OF, name)
}

/// Render a label map as a list-request selector string.
pub fn label_selector(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_condition_appends_new_types_in_order() {
        let mut conditions = vec![];
        set_condition(&mut conditions, Condition::new("A", true, "r1", "m1"));
        set_condition(&mut conditions, Condition::new("B", false, "r2", "m2"));
        assert_eq!(conditions.len(), 2);
        assert_eq!(conditions[0].type_, "A");
        assert_eq!(conditions[1].type_, "B");
    }

    #[test]
    fn set_condition_replaces_same_type_in_place() {
        let mut conditions = vec![
            Condition::new("A", true, "r1", "m1"),
            Condition::new("B", true, "r1", "m1"),
        ];
        set_condition(&mut conditions, Condition::new("A", false, "r2", "m2"));
        assert_eq!(conditions.len(), 2);
        assert_eq!(conditions[0].type_, "A");
        assert_eq!(conditions[0].status, "False");
        assert_eq!(conditions[0].reason, "r2");
    }

    #[test]
    fn set_condition_preserves_transition_time_when_status_unchanged() {
        let mut first = Condition::new("A", true, "r1", "m1");
        first.last_transition_time = Some("2024-01-01T00:00:00+00:00".to_string());
        let mut conditions = vec![first];

        set_condition(&mut conditions, Condition::new("A", true, "r2", "m2"));
        assert_eq!(
            conditions[0].last_transition_time.as_deref(),
            Some("2024-01-01T00:00:00+00:00")
        );

        set_condition(&mut conditions, Condition::new("A", false, "r3", "m3"));
        assert_ne!(
            conditions[0].last_transition_time.as_deref(),
            Some("2024-01-01T00:00:00+00:00")
        );
    }

    #[test]
    fn labels_and_selectors() {
        let labels = standard_labels("chat", SERVICE_LABEL_PART_OF);
        assert_eq!(labels[LABEL_KEY_NAME], "chat");
        assert_eq!(labels[LABEL_KEY_PART_OF], "mis-service");
        assert_eq!(labels[LABEL_KEY_MANAGED_BY], "mis-operator");

        assert_eq!(service_selector_string("chat"), "mis-service=chat");
        let selector = label_selector(&service_selector_labels("chat"));
        assert_eq!(selector, "mis-service=chat");
    }
}
