//! Wire payloads returned by the backend's list endpoints.
//!
//! Unknown fields are ignored and missing optional fields are left out of the
//! resulting entity, so they never overwrite cached values on merge.

use serde::Deserialize;
use serde_json::Value;

use crate::error::NetworkError;
use crate::models::{Entity, EntityKind};
use crate::query::Cursor;

use super::Page;

#[derive(Debug, Clone, Deserialize)]
pub struct UserPayload {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub online: Option<bool>,
    #[serde(default)]
    pub banned: Option<bool>,
    #[serde(default)]
    pub last_active: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
}

impl UserPayload {
    pub fn into_entity(self) -> Entity {
        let mut entity = Entity::new(EntityKind::User, self.id);
        set(&mut entity, "name", self.name);
        set(&mut entity, "image", self.image);
        set(&mut entity, "role", self.role);
        set(&mut entity, "online", self.online);
        set(&mut entity, "banned", self.banned);
        set(&mut entity, "last_active", self.last_active);
        set(&mut entity, "created_at", self.created_at);
        set(&mut entity, "updated_at", self.updated_at);
        entity
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChannelPayload {
    pub cid: String,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default, rename = "type")]
    pub channel_type: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub member_count: Option<u64>,
    #[serde(default)]
    pub frozen: Option<bool>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
    #[serde(default)]
    pub last_message_at: Option<String>,
}

impl ChannelPayload {
    pub fn into_entity(self) -> Entity {
        let mut entity = Entity::new(EntityKind::Channel, self.cid);
        set(&mut entity, "id", self.id);
        set(&mut entity, "type", self.channel_type);
        set(&mut entity, "name", self.name);
        set(&mut entity, "image", self.image);
        set(&mut entity, "member_count", self.member_count);
        set(&mut entity, "frozen", self.frozen);
        set(&mut entity, "created_at", self.created_at);
        set(&mut entity, "updated_at", self.updated_at);
        set(&mut entity, "last_message_at", self.last_message_at);
        entity
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MessagePayload {
    pub id: String,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub user: Option<UserPayload>,
    #[serde(default)]
    pub cid: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
}

impl MessagePayload {
    pub fn into_entity(self) -> Entity {
        let mut entity = Entity::new(EntityKind::Message, self.id);
        set(&mut entity, "text", self.text);
        set(&mut entity, "user_id", self.user.map(|u| u.id));
        set(&mut entity, "cid", self.cid);
        set(&mut entity, "created_at", self.created_at);
        entity
    }
}

#[derive(Debug, Deserialize)]
struct UserListResponse {
    users: Vec<UserPayload>,
    #[serde(default)]
    next: Option<String>,
}

/// Channel queries wrap each channel with its state.
#[derive(Debug, Deserialize)]
struct ChannelState {
    channel: ChannelPayload,
}

#[derive(Debug, Deserialize)]
struct ChannelListResponse {
    channels: Vec<ChannelState>,
    #[serde(default)]
    next: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SearchResult {
    message: MessagePayload,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    results: Vec<SearchResult>,
    #[serde(default)]
    next: Option<String>,
}

/// Decode a list response body for `kind` into a page, preserving order.
pub fn decode_page(kind: EntityKind, body: &[u8]) -> Result<Page, NetworkError> {
    let decode_err = |e: serde_json::Error| NetworkError::Decode(e.to_string());
    let (entities, next) = match kind {
        EntityKind::User => {
            let response: UserListResponse = serde_json::from_slice(body).map_err(decode_err)?;
            let entities = response
                .users
                .into_iter()
                .map(UserPayload::into_entity)
                .collect();
            (entities, response.next)
        }
        EntityKind::Channel => {
            let response: ChannelListResponse =
                serde_json::from_slice(body).map_err(decode_err)?;
            let entities = response
                .channels
                .into_iter()
                .map(|state| state.channel.into_entity())
                .collect();
            (entities, response.next)
        }
        EntityKind::Message => {
            let response: SearchResponse = serde_json::from_slice(body).map_err(decode_err)?;
            let entities = response
                .results
                .into_iter()
                .map(|result| result.message.into_entity())
                .collect();
            (entities, response.next)
        }
    };

    Ok(Page {
        entities,
        next_cursor: next.filter(|n| !n.is_empty()).map(Cursor::new),
    })
}

fn set<V: Into<Value>>(entity: &mut Entity, key: &str, value: Option<V>) {
    if let Some(value) = value {
        entity.attributes.insert(key.to_string(), value.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_users_ignores_unknown_fields() {
        let body = br#"{
            "users": [
                {"id": "Luke", "name": "Luke Skywalker", "online": true, "teams": ["rebels"]},
                {"id": "Leia"}
            ],
            "duration": "1.2ms",
            "next": "page-2"
        }"#;
        let page = decode_page(EntityKind::User, body).unwrap();
        assert_eq!(page.entities.len(), 2);
        assert_eq!(page.entities[0].str_attr("name"), Some("Luke Skywalker"));
        assert_eq!(page.entities[0].bool_attr("online"), Some(true));
        assert!(!page.entities[0].attributes.contains_key("teams"));
        assert!(page.entities[1].attributes.is_empty());
        assert_eq!(page.next_cursor, Some(Cursor::new("page-2")));
    }

    #[test]
    fn test_decode_channels_uses_cid_as_id() {
        let body = br#"{"channels": [{"channel": {"cid": "messaging:general", "id": "general", "type": "messaging", "member_count": 4}, "members": []}]}"#;
        let page = decode_page(EntityKind::Channel, body).unwrap();
        assert_eq!(page.entities[0].id.as_str(), "messaging:general");
        assert_eq!(page.entities[0].str_attr("id"), Some("general"));
        assert_eq!(page.entities[0].str_attr("type"), Some("messaging"));
        assert_eq!(page.entities[0].u64_attr("member_count"), Some(4));
        assert!(page.next_cursor.is_none());
    }

    #[test]
    fn test_decode_search_results() {
        let body = br#"{"results": [{"message": {"id": "m1", "text": "hi", "user": {"id": "Luke"}}}]}"#;
        let page = decode_page(EntityKind::Message, body).unwrap();
        assert_eq!(page.entities[0].str_attr("user_id"), Some("Luke"));
    }

    #[test]
    fn test_decode_failure_is_decode_error() {
        let result = decode_page(EntityKind::User, br#"{"channels": []}"#);
        assert!(matches!(result, Err(NetworkError::Decode(_))));
    }
}
