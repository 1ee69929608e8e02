use super::entity::{Entity, EntityKind};

const DEFAULT_ROLE: &str = "user";

/// Display-ready user derived from a cached entity.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatUser {
    pub id: String,
    pub name: Option<String>,
    pub image_url: Option<String>,
    pub role: String,
    pub is_online: bool,
    pub is_banned: bool,
    pub last_active_at: Option<String>,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
}

impl ChatUser {
    pub fn from_entity(entity: &Entity) -> Option<Self> {
        if entity.kind != EntityKind::User {
            return None;
        }

        Some(Self {
            id: entity.id.to_string(),
            name: entity.str_attr("name").map(str::to_string),
            image_url: entity.str_attr("image").map(str::to_string),
            role: entity
                .str_attr("role")
                .unwrap_or(DEFAULT_ROLE)
                .to_string(),
            is_online: entity.bool_attr("online").unwrap_or(false),
            is_banned: entity.bool_attr("banned").unwrap_or(false),
            last_active_at: entity.str_attr("last_active").map(str::to_string),
            created_at: entity.str_attr("created_at").map(str::to_string),
            updated_at: entity.str_attr("updated_at").map(str::to_string),
        })
    }

    /// Name if set, otherwise the id.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_for_missing_fields() {
        let user = ChatUser::from_entity(&Entity::new(EntityKind::User, "luke")).unwrap();
        assert_eq!(user.role, "user");
        assert!(!user.is_online);
        assert_eq!(user.display_name(), "luke");
    }

    #[test]
    fn test_rejects_other_kinds() {
        assert!(ChatUser::from_entity(&Entity::new(EntityKind::Channel, "luke")).is_none());
    }
}
