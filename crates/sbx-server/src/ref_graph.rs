//! Per-peer reference graph.
//!
//! The server's view of one user's (user, file, ref) rows, built lazily when
//! a peer first identifies itself. Mutating operations go straight to the
//! database so concurrent peers of the same user stay consistent; the
//! duplicate-key outcome is what drives content dedup.

use tracing::debug;

use sbx_core::error::{Error, Result};
use sbx_core::tree::File;

use crate::db::{AddOutcome, Db, FileRecord, UserRecord};

pub struct RefGraph {
    user: UserRecord,
    db: Db,
}

impl RefGraph {
    /// Load (creating the user on first contact) the graph for `username`.
    pub async fn load(db: Db, username: &str, password: &str) -> Result<Self> {
        let user = db.get_or_create_user(username, password).await?;
        let files = db.file_records(user.id).await?;
        let refs = db.file_ref_records(user.id).await?;
        debug!(
            username,
            files = files.len(),
            refs = refs.len(),
            "loaded reference graph"
        );
        Ok(Self { user, db })
    }

    pub fn user(&self) -> &UserRecord {
        &self.user
    }

    /// Register a content for this user. `Duplicate` means another path or
    /// device already uploaded the same bytes and the transfer can be
    /// skipped.
    pub async fn add_file_record(&self, file: &File) -> Result<AddOutcome> {
        self.db
            .add_file_record(self.user.id, &file.checksum().to_num_string())
            .await
    }

    /// Witness a placement of `file` at (path, device).
    pub async fn add_file_ref_record(
        &self,
        file: &File,
        path: &str,
        device: &str,
    ) -> Result<AddOutcome> {
        let checksum = file.checksum().to_num_string();
        let record = self
            .db
            .file_record(self.user.id, &checksum)
            .await?
            .ok_or_else(|| {
                Error::database(format!("no file record for checksum {checksum}"))
            })?;
        self.db
            .add_file_ref_record(self.user.id, record.id, path, device)
            .await
    }

    /// Drop every placement of this content for the user.
    pub async fn delete_file_ref_records(&self, file: &File) -> Result<u64> {
        self.db
            .delete_file_ref_records(self.user.id, &file.checksum().to_num_string())
            .await
    }

    /// File rows with zero surviving placements.
    pub async fn no_ref_files(&self) -> Result<Vec<FileRecord>> {
        self.db.no_ref_files(self.user.id).await
    }

    pub async fn delete_file_record(&self, record: &FileRecord) -> Result<()> {
        self.db.delete_file_record(record.id).await
    }
}
