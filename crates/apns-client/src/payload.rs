//! Notification payload: the JSON document delivered to the recipient.

use std::sync::OnceLock;

use serde::Serialize;
use serde_json::{json, Map, Value};

/// An alert that is either a bare string or a full alert dictionary.
#[derive(Clone, Debug, Serialize)]
#[serde(untagged)]
pub enum AlertValue {
    Text(String),
    Detailed(Alert),
}

impl From<&str> for AlertValue {
    fn from(s: &str) -> Self {
        AlertValue::Text(s.to_string())
    }
}

impl From<String> for AlertValue {
    fn from(s: String) -> Self {
        AlertValue::Text(s)
    }
}

impl From<Alert> for AlertValue {
    fn from(a: Alert) -> Self {
        AlertValue::Detailed(a)
    }
}

/// The alert dictionary understood by the notification UI.
#[derive(Clone, Debug, Default, Serialize)]
pub struct Alert {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(rename = "action-loc-key", skip_serializing_if = "Option::is_none")]
    pub action_loc_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(rename = "launch-image", skip_serializing_if = "Option::is_none")]
    pub launch_image: Option<String>,
    #[serde(rename = "loc-args", skip_serializing_if = "Vec::is_empty")]
    pub loc_args: Vec<String>,
    #[serde(rename = "loc-key", skip_serializing_if = "Option::is_none")]
    pub loc_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subtitle: Option<String>,
    #[serde(rename = "title-loc-args", skip_serializing_if = "Vec::is_empty")]
    pub title_loc_args: Vec<String>,
    #[serde(rename = "title-loc-key", skip_serializing_if = "Option::is_none")]
    pub title_loc_key: Option<String>,
}

/// The `aps` dictionary carrying the system-interpreted fields.
#[derive(Clone, Debug, Default)]
pub struct Aps {
    pub alert: Option<AlertValue>,
    pub badge: Option<u32>,
    pub category: Option<String>,
    pub content_available: bool,
    pub mutable_content: bool,
    pub sound: Option<String>,
    pub thread_id: Option<String>,
    pub url_args: Vec<String>,
}

impl Aps {
    /// Convenience for the common case of a plain alert string.
    pub fn alert(text: impl Into<AlertValue>) -> Self {
        Aps {
            alert: Some(text.into()),
            ..Aps::default()
        }
    }

    fn add_to_map(&self, m: &mut Map<String, Value>) {
        if let Some(alert) = &self.alert {
            m.insert("alert".into(), json!(alert));
        }
        if let Some(badge) = self.badge {
            m.insert("badge".into(), json!(badge));
        }
        if let Some(category) = &self.category {
            m.insert("category".into(), json!(category));
        }
        if self.content_available {
            m.insert("content-available".into(), json!(1));
        }
        if self.mutable_content {
            m.insert("mutable-content".into(), json!(1));
        }
        if let Some(sound) = &self.sound {
            m.insert("sound".into(), json!(sound));
        }
        if let Some(thread_id) = &self.thread_id {
            m.insert("thread-id".into(), json!(thread_id));
        }
        if !self.url_args.is_empty() {
            m.insert("url-args".into(), json!(self.url_args));
        }
    }
}

#[derive(Clone, Debug)]
enum PayloadForm {
    /// Pre-encoded JSON, passed through verbatim.
    Raw(Vec<u8>),
    /// Structured content: system fields under `aps`, user keys at the
    /// top level.
    Object {
        aps: Option<Aps>,
        custom: Map<String, Value>,
    },
}

/// The container for the data delivered to the recipient.
///
/// A payload is meant to stay immutable once created so the same payload
/// can be shared across any number of notifications. The serialized form
/// is computed once and cached; every call observes identical bytes.
#[derive(Debug)]
pub struct Payload {
    form: PayloadForm,
    json: OnceLock<Vec<u8>>,
}

impl Payload {
    /// Payload with only an `aps` dictionary.
    pub fn aps(aps: Aps) -> Self {
        Self::object(Some(aps), Map::new())
    }

    /// Payload with an optional `aps` dictionary and user keys merged at
    /// the top level. An `aps` entry in `custom` is overwritten by the
    /// structured one.
    pub fn object(aps: Option<Aps>, custom: Map<String, Value>) -> Self {
        Payload {
            form: PayloadForm::Object { aps, custom },
            json: OnceLock::new(),
        }
    }

    /// Payload from JSON bytes produced elsewhere. The bytes are not
    /// validated.
    pub fn from_json_bytes(bytes: Vec<u8>) -> Self {
        Payload {
            form: PayloadForm::Raw(bytes),
            json: OnceLock::new(),
        }
    }

    /// Payload from a JSON string produced elsewhere.
    pub fn from_json_string(s: impl Into<String>) -> Self {
        Self::from_json_bytes(s.into().into_bytes())
    }

    /// The serialized payload. Computed on first use, cached thereafter.
    pub fn encoded(&self) -> Result<&[u8], serde_json::Error> {
        if let Some(bytes) = self.json.get() {
            return Ok(bytes);
        }
        let bytes = match &self.form {
            PayloadForm::Raw(b) => b.clone(),
            PayloadForm::Object { .. } => serde_json::to_vec(&self.merged_map())?,
        };
        Ok(self.json.get_or_init(|| bytes))
    }

    fn merged_map(&self) -> Map<String, Value> {
        let (aps, custom) = match &self.form {
            PayloadForm::Object { aps, custom } => (aps, custom),
            PayloadForm::Raw(_) => return Map::new(),
        };
        let mut res = custom.clone();
        match aps {
            Some(a) => {
                let slot = res
                    .entry("aps".to_string())
                    .or_insert_with(|| Value::Object(Map::new()));
                if !slot.is_object() {
                    *slot = Value::Object(Map::new());
                }
                if let Value::Object(m) = slot {
                    a.add_to_map(m);
                }
            }
            None => {}
        }
        res
    }
}

impl Clone for Payload {
    fn clone(&self) -> Self {
        Payload {
            form: self.form.clone(),
            json: OnceLock::new(),
        }
    }
}
