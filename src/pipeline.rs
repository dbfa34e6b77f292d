//! The transform pipeline: filters by table/operation, applies PII
//! masking, and assigns a destination route. Stateless per event.

use crate::config::{PIIMaskAction, PipelineConfig};
use crate::model::{ChangeEvent, Row, Value};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};

pub struct TransformPipeline {
    config: Arc<PipelineConfig>,
}

impl TransformPipeline {
    pub fn new(config: Arc<PipelineConfig>) -> Self {
        Self { config }
    }

    /// Spawns the single worker that drains `input` and forwards
    /// transformed events to the returned receiver. When `input` closes,
    /// the worker closes its output and exits; there is no explicit stop.
    pub fn start(&self, mut input: mpsc::Receiver<ChangeEvent>) -> mpsc::Receiver<ChangeEvent> {
        let (tx, rx) = mpsc::channel(100);
        let config = self.config.clone();

        tokio::spawn(async move {
            while let Some(event) = input.recv().await {
                if let Some(transformed) = transform(&config, event) {
                    if tx.send(transformed).await.is_err() {
                        break;
                    }
                }
            }
            debug!("transform pipeline input closed, worker exiting");
        });

        rx
    }
}

fn transform(config: &PipelineConfig, mut event: ChangeEvent) -> Option<ChangeEvent> {
    if config.excluded_tables.contains(&event.table) {
        return None;
    }

    let table_options = config.tables.get(&event.table);

    if let Some(options) = table_options {
        let op_name = event.operation.as_config_name();
        if !options.allowed_operations.iter().any(|o| o == op_name) {
            return None;
        }
    }

    if let Some(options) = table_options {
        for mask in &options.pii_masks {
            if let Some(before) = event.before.as_mut() {
                apply_mask(before, &mask.field, &mask.action);
            }
            if let Some(after) = event.after.as_mut() {
                apply_mask(after, &mask.field, &mask.action);
            }
        }
    }

    event.route = match table_options {
        Some(options) => options.route_to.clone(),
        None => config.default_route.clone(),
    };

    info!(table = %event.table, route = %event.route, "transformed event");
    Some(event)
}

fn apply_mask(row: &mut Row, field: &str, action: &PIIMaskAction) {
    let Some(value) = row.get(field) else { return };
    let masked = match action {
        PIIMaskAction::Redact => Value::Text("REDACTED".to_string()),
        PIIMaskAction::Hash => Value::Text(hash_hex(&value.default_string())),
        PIIMaskAction::MaskPartial => match value {
            Value::Text(s) => Value::Text(mask_partial(s)),
            other => other.clone(),
        },
    };
    row.insert(field.to_string(), masked);
}

fn hash_hex(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    hex::encode(digest)
}

/// `n <= 4` → `n` asterisks; otherwise first `n-4` chars masked, last 4 kept.
fn mask_partial(s: &str) -> String {
    let chars: Vec<char> = s.chars().collect();
    let n = chars.len();
    if n <= 4 {
        "*".repeat(n)
    } else {
        let mut masked: String = "*".repeat(n - 4);
        masked.extend(&chars[n - 4..]);
        masked
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{TableOptions, PIIMask};
    use crate::model::Operation;
    use std::collections::{HashMap, HashSet};

    #[test]
    fn mask_partial_boundary_cases() {
        assert_eq!(mask_partial(""), "");
        assert_eq!(mask_partial("abcd"), "****");
        assert_eq!(mask_partial("abcde"), "*bcde");
        assert_eq!(mask_partial("123-45-6789"), "*******6789");
    }

    #[test]
    fn hash_differs_from_redact_on_same_input() {
        let hashed = hash_hex("a@b.c");
        assert_ne!(hashed, "REDACTED");
    }

    fn users_config(operations: Vec<&str>) -> PipelineConfig {
        let mut tables = HashMap::new();
        tables.insert(
            "users".to_string(),
            TableOptions {
                allowed_operations: operations.into_iter().map(String::from).collect(),
                pii_masks: vec![PIIMask { field: "email".to_string(), action: PIIMaskAction::Hash }],
                route_to: "user_events".to_string(),
            },
        );
        PipelineConfig {
            tables,
            default_route: "default".to_string(),
            excluded_tables: HashSet::from(["audit_log".to_string()]),
        }
    }

    fn insert_event(table: &str, email: Option<&str>) -> ChangeEvent {
        let mut after = Row::new();
        after.insert("id".to_string(), Value::I32(1));
        if let Some(email) = email {
            after.insert("email".to_string(), Value::Text(email.to_string()));
        }
        ChangeEvent {
            operation: Operation::Insert,
            namespace: "public".to_string(),
            table: table.to_string(),
            before: None,
            after: Some(after),
            lsn: "0/1".to_string(),
            route: String::new(),
            pk: vec!["id".to_string()],
        }
    }

    #[test]
    fn excluded_table_is_dropped() {
        let config = users_config(vec!["INSERT"]);
        let event = insert_event("audit_log", None);
        assert!(transform(&config, event).is_none());
    }

    #[test]
    fn disallowed_operation_is_dropped() {
        let config = users_config(vec!["UPDATE"]);
        let event = insert_event("users", Some("a@b.c"));
        assert!(transform(&config, event).is_none());
    }

    #[test]
    fn unconfigured_table_passes_through_with_default_route() {
        let config = users_config(vec!["INSERT"]);
        let event = insert_event("shipments", None);
        let transformed = transform(&config, event).unwrap();
        assert_eq!(transformed.route, "default");
    }

    #[test]
    fn configured_table_gets_masked_and_routed() {
        let config = users_config(vec!["INSERT"]);
        let event = insert_event("users", Some("a@b.c"));
        let transformed = transform(&config, event).unwrap();
        assert_eq!(transformed.route, "user_events");
        let email = transformed.after.unwrap().get("email").unwrap().clone();
        assert_eq!(email, Value::Text(hash_hex("a@b.c")));
    }
}
