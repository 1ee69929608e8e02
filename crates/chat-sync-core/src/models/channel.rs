use super::entity::{Entity, EntityKind};

#[derive(Debug, Clone, PartialEq)]
pub struct ChatChannel {
    /// `type:id` channel identifier.
    pub cid: String,
    pub name: Option<String>,
    pub image_url: Option<String>,
    pub member_count: u64,
    pub is_frozen: bool,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
    pub last_message_at: Option<String>,
}

impl ChatChannel {
    pub fn from_entity(entity: &Entity) -> Option<Self> {
        if entity.kind != EntityKind::Channel {
            return None;
        }

        Some(Self {
            cid: entity.id.to_string(),
            name: entity.str_attr("name").map(str::to_string),
            image_url: entity.str_attr("image").map(str::to_string),
            member_count: entity.u64_attr("member_count").unwrap_or(0),
            is_frozen: entity.bool_attr("frozen").unwrap_or(false),
            created_at: entity.str_attr("created_at").map(str::to_string),
            updated_at: entity.str_attr("updated_at").map(str::to_string),
            last_message_at: entity.str_attr("last_message_at").map(str::to_string),
        })
    }
}
