use super::entity::{Entity, EntityKind};

#[derive(Debug, Clone, PartialEq)]
pub struct ChatMessage {
    pub id: String,
    pub text: String,
    pub author_id: Option<String>,
    pub cid: Option<String>,
    pub created_at: Option<String>,
}

impl ChatMessage {
    pub fn from_entity(entity: &Entity) -> Option<Self> {
        if entity.kind != EntityKind::Message {
            return None;
        }

        Some(Self {
            id: entity.id.to_string(),
            text: entity.str_attr("text").unwrap_or_default().to_string(),
            author_id: entity.str_attr("user_id").map(str::to_string),
            cid: entity.str_attr("cid").map(str::to_string),
            created_at: entity.str_attr("created_at").map(str::to_string),
        })
    }
}
