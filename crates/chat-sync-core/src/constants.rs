use crate::models::EntityKind;

/// SQLite file inside the data directory.
pub const DATABASE_FILE: &str = "chat_sync.db";

pub const USERS_PAGE_SIZE: u32 = 30;
pub const CHANNELS_PAGE_SIZE: u32 = 20;
pub const MESSAGES_PAGE_SIZE: u32 = 25;

pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

pub const LOG_FILE_ENV: &str = "CHAT_SYNC_LOG_FILE";

pub fn default_page_size(kind: EntityKind) -> u32 {
    match kind {
        EntityKind::User => USERS_PAGE_SIZE,
        EntityKind::Channel => CHANNELS_PAGE_SIZE,
        EntityKind::Message => MESSAGES_PAGE_SIZE,
    }
}
