use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    User,
    Channel,
    Message,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::User => "user",
            EntityKind::Channel => "channel",
            EntityKind::Message => "message",
        }
    }

    /// Wire field holding the entity key. Channels are keyed by `cid`
    /// (`type:id`); their bare `id` is only unique within a channel type.
    pub fn id_field(&self) -> &'static str {
        match self {
            EntityKind::Channel => "cid",
            EntityKind::User | EntityKind::Message => "id",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "user" | "users" => Some(EntityKind::User),
            "channel" | "channels" => Some(EntityKind::Channel),
            "message" | "messages" => Some(EntityKind::Message),
            _ => None,
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntityId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for EntityId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// A cached user, channel or message. Owned by the local store; query records
/// only reference it by id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub kind: EntityKind,
    pub id: EntityId,
    pub attributes: BTreeMap<String, Value>,
    /// Store version at which this entity last changed. Zero until first stored.
    #[serde(default)]
    pub version: u64,
}

impl Entity {
    pub fn new(kind: EntityKind, id: impl Into<EntityId>) -> Self {
        Self {
            kind,
            id: id.into(),
            attributes: BTreeMap::new(),
            version: 0,
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Field lookup used by filter evaluation. The kind's key field resolves to
    /// the entity id.
    pub fn field(&self, name: &str) -> Option<Value> {
        if name == self.kind.id_field() {
            return Some(Value::String(self.id.as_str().to_string()));
        }
        self.attributes.get(name).cloned()
    }

    pub fn str_attr(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).and_then(Value::as_str)
    }

    pub fn bool_attr(&self, name: &str) -> Option<bool> {
        self.attributes.get(name).and_then(Value::as_bool)
    }

    pub fn u64_attr(&self, name: &str) -> Option<u64> {
        self.attributes.get(name).and_then(Value::as_u64)
    }

    /// Attribute-level merge: non-null incoming values overwrite, everything else is kept.
    /// Returns whether any attribute changed.
    pub fn merge_from(&mut self, incoming: &Entity) -> bool {
        let mut changed = false;
        for (key, value) in &incoming.attributes {
            if value.is_null() {
                continue;
            }
            if self.attributes.get(key) != Some(value) {
                self.attributes.insert(key.clone(), value.clone());
                changed = true;
            }
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_merge_keeps_existing_fields_on_null() {
        let mut stored = Entity::new(EntityKind::User, "luke")
            .with_attribute("name", "Luke")
            .with_attribute("role", "admin");
        let incoming = Entity::new(EntityKind::User, "luke")
            .with_attribute("name", Value::Null)
            .with_attribute("role", "user")
            .with_attribute("online", true);

        assert!(stored.merge_from(&incoming));
        assert_eq!(stored.str_attr("name"), Some("Luke"));
        assert_eq!(stored.str_attr("role"), Some("user"));
        assert_eq!(stored.bool_attr("online"), Some(true));
    }

    #[test]
    fn test_merge_reports_no_change_for_identical_payload() {
        let mut stored = Entity::new(EntityKind::User, "luke").with_attribute("name", "Luke");
        let incoming = stored.clone();
        assert!(!stored.merge_from(&incoming));
    }

    #[test]
    fn test_id_field_resolves_to_entity_id() {
        let entity = Entity::new(EntityKind::User, "luke");
        assert_eq!(entity.field("id"), Some(json!("luke")));
        assert_eq!(entity.field("name"), None);
    }

    #[test]
    fn test_channel_key_field_is_cid() {
        let entity =
            Entity::new(EntityKind::Channel, "messaging:general").with_attribute("id", "general");
        assert_eq!(entity.field("cid"), Some(json!("messaging:general")));
        assert_eq!(entity.field("id"), Some(json!("general")));
    }

    #[test]
    fn test_kind_parse_accepts_plural() {
        assert_eq!(EntityKind::parse("users"), Some(EntityKind::User));
        assert_eq!(EntityKind::parse("channel"), Some(EntityKind::Channel));
        assert_eq!(EntityKind::parse("reactions"), None);
    }
}
