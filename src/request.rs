use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Caller-defined options, opaque to the orchestrator.
pub type Settings = BTreeMap<String, Value>;

/// Opaque handle to an image payload. Image bytes never enter orchestration state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PayloadRef(pub String);

impl PayloadRef {
    pub fn new(handle: impl Into<String>) -> Self {
        Self(handle.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PayloadRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// One step of a sequence job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubCommand {
    pub id: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub depends_on: BTreeSet<String>,
    /// Tie-break hint among independent steps; not authoritative.
    #[serde(default)]
    pub order_hint: i64,
}

impl SubCommand {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            payload: Value::Null,
            depends_on: BTreeSet::new(),
            order_hint: 0,
        }
    }

    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on.extend(deps.into_iter().map(Into::into));
        self
    }

    pub fn with_hint(mut self, order_hint: i64) -> Self {
        self.order_hint = order_hint;
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }
}

/// An image-transformation request as accepted at the service boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingRequest {
    /// Caller-supplied id; generated on submission when absent.
    #[serde(default)]
    pub id: Option<String>,
    pub service_id: String,
    pub payload_ref: PayloadRef,
    #[serde(default)]
    pub settings: Settings,
    #[serde(default)]
    pub sub_commands: Vec<SubCommand>,
    #[serde(default)]
    pub access_key: Option<String>,
    /// Input size in bytes, used for routing decisions.
    #[serde(default)]
    pub size_hint: Option<u64>,
    #[serde(default = "Utc::now")]
    pub requested_at: DateTime<Utc>,
}

impl ProcessingRequest {
    pub fn new(service_id: impl Into<String>, payload_ref: PayloadRef) -> Self {
        Self {
            id: None,
            service_id: service_id.into(),
            payload_ref,
            settings: Settings::new(),
            sub_commands: Vec::new(),
            access_key: None,
            size_hint: None,
            requested_at: Utc::now(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_setting(mut self, name: impl Into<String>, value: Value) -> Self {
        self.settings.insert(name.into(), value);
        self
    }

    pub fn with_key(mut self, access_key: impl Into<String>) -> Self {
        self.access_key = Some(access_key.into());
        self
    }

    pub fn with_sub_commands(mut self, sub_commands: Vec<SubCommand>) -> Self {
        self.sub_commands = sub_commands;
        self
    }

    pub fn with_size_hint(mut self, bytes: u64) -> Self {
        self.size_hint = Some(bytes);
        self
    }

    /// More than one sub-command makes a sequence job.
    pub fn is_sequence(&self) -> bool {
        self.sub_commands.len() > 1
    }
}

/// Settings passed to the invoker for one resolved step.
pub fn step_settings(base: &Settings, step: Option<&SubCommand>) -> Settings {
    let mut settings = base.clone();
    if let Some(step) = step {
        settings.insert(
            "subCommand".to_string(),
            serde_json::json!({ "id": step.id, "payload": step.payload }),
        );
    }
    settings
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn deserializes_inbound_shape() {
        let req: ProcessingRequest = serde_json::from_value(json!({
            "id": "r1",
            "serviceId": "enhance",
            "payloadRef": "blob://in.png",
            "settings": { "factor": 4 },
            "subCommands": [
                { "id": "a", "payload": {"op": "crop"}, "dependsOn": [], "orderHint": 1 },
                { "id": "b", "dependsOn": ["a"], "orderHint": 0 }
            ],
            "accessKey": "K1"
        }))
        .unwrap();

        assert_eq!(req.id.as_deref(), Some("r1"));
        assert_eq!(req.payload_ref.as_str(), "blob://in.png");
        assert_eq!(req.settings["factor"], json!(4));
        assert!(req.is_sequence());
        assert!(req.sub_commands[1].depends_on.contains("a"));
    }

    #[test]
    fn single_sub_command_is_simple_job() {
        let req = ProcessingRequest::new("enhance", PayloadRef::new("p"))
            .with_sub_commands(vec![SubCommand::new("only")]);
        assert!(!req.is_sequence());
    }

    #[test]
    fn step_settings_embed_sub_command() {
        let base: Settings = [("factor".to_string(), json!(2))].into_iter().collect();
        let step = SubCommand::new("s1").with_payload(json!({"op": "blur"}));
        let settings = step_settings(&base, Some(&step));
        assert_eq!(settings["factor"], json!(2));
        assert_eq!(settings["subCommand"]["id"], json!("s1"));
        assert_eq!(step_settings(&base, None), base);
    }
}
