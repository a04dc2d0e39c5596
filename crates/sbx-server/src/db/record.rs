//! Row types for the reference tables.

use sqlx::FromRow;

/// A registered user. Created on first contact, never deleted.
#[derive(Debug, Clone, FromRow)]
pub struct UserRecord {
    pub id: i64,
    pub username: String,
    pub password: String,
}

/// One distinct content checksum owned by a user. The checksum column holds
/// the decimal num-string, identical to the blob object name.
#[derive(Debug, Clone, FromRow)]
pub struct FileRecord {
    pub id: i64,
    pub checksum: String,
    pub user_id: i64,
}

/// One placement of a content: (user, file, path, device) is the composite
/// key, witnessing that this content sits at this relative path on this
/// device.
#[derive(Debug, Clone, FromRow)]
pub struct FileRefRecord {
    pub user_id: i64,
    pub file_id: i64,
    pub path: String,
    pub device: String,
}
