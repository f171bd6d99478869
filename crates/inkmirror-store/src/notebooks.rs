//! Notebook repository
//!
//! Notebooks form a per-user tree via `parent_uuid`. Deleting a notebook
//! cascades to its pages (schema-level), and page deletion in turn orphans
//! nothing: sync records and work items are cleaned by their own owners.

use std::str::FromStr;

use sqlx::{Row, SqlitePool};

use inkmirror_core::domain::newtypes::{NotebookUuid, UserId};
use inkmirror_core::domain::{DocumentType, Notebook};

use crate::time::{fmt_ts, parse_ts};
use crate::StoreError;

/// Repository for notebook rows
pub struct NotebookRepository {
    pool: SqlitePool,
}

impl NotebookRepository {
    /// Creates a new repository instance with the given connection pool
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Inserts or updates a notebook (device metadata wins)
    pub async fn upsert(&self, notebook: &Notebook) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO notebooks \
             (user_id, notebook_uuid, visible_name, parent_uuid, document_type, last_modified) \
             VALUES (?, ?, ?, ?, ?, ?) \
             ON CONFLICT (user_id, notebook_uuid) DO UPDATE SET \
             visible_name = excluded.visible_name, \
             parent_uuid = excluded.parent_uuid, \
             document_type = excluded.document_type, \
             last_modified = excluded.last_modified",
        )
        .bind(notebook.user_id.to_string())
        .bind(notebook.notebook_uuid.to_string())
        .bind(&notebook.visible_name)
        .bind(notebook.parent_uuid.map(|p| p.to_string()))
        .bind(notebook.document_type.as_str())
        .bind(fmt_ts(notebook.last_modified))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Fetches one notebook
    pub async fn get(
        &self,
        user_id: &UserId,
        notebook_uuid: &NotebookUuid,
    ) -> Result<Option<Notebook>, StoreError> {
        let row = sqlx::query(
            "SELECT user_id, notebook_uuid, visible_name, parent_uuid, document_type, \
             last_modified FROM notebooks WHERE user_id = ? AND notebook_uuid = ?",
        )
        .bind(user_id.to_string())
        .bind(notebook_uuid.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| Self::map_notebook(&r)).transpose()
    }

    /// Lists a user's notebooks, folders included, by visible name
    pub async fn list(&self, user_id: &UserId) -> Result<Vec<Notebook>, StoreError> {
        let rows = sqlx::query(
            "SELECT user_id, notebook_uuid, visible_name, parent_uuid, document_type, \
             last_modified FROM notebooks WHERE user_id = ? ORDER BY visible_name",
        )
        .bind(user_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::map_notebook).collect()
    }

    /// Resolves a notebook's folder path by walking parent links to the root
    ///
    /// Returns `/`-separated visible names, innermost last, not including the
    /// notebook itself. Cycles are impossible by construction (the device
    /// tree is acyclic) but the walk is depth-bounded anyway.
    pub async fn folder_path(
        &self,
        user_id: &UserId,
        notebook_uuid: &NotebookUuid,
    ) -> Result<Option<String>, StoreError> {
        let mut segments: Vec<String> = Vec::new();
        let mut current = self.get(user_id, notebook_uuid).await?;
        let mut depth = 0;

        while let Some(nb) = current {
            let Some(parent_uuid) = nb.parent_uuid else {
                break;
            };
            depth += 1;
            if depth > 32 {
                return Err(StoreError::SerializationError(format!(
                    "notebook tree deeper than 32 levels at {notebook_uuid}"
                )));
            }
            let parent = self.get(user_id, &parent_uuid).await?;
            if let Some(ref p) = parent {
                segments.push(p.visible_name.clone());
            }
            current = parent;
        }

        if segments.is_empty() {
            return Ok(None);
        }
        segments.reverse();
        Ok(Some(segments.join("/")))
    }

    /// Deletes a notebook; its pages cascade
    pub async fn delete(
        &self,
        user_id: &UserId,
        notebook_uuid: &NotebookUuid,
    ) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM notebooks WHERE user_id = ? AND notebook_uuid = ?")
            .bind(user_id.to_string())
            .bind(notebook_uuid.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    fn map_notebook(row: &sqlx::sqlite::SqliteRow) -> Result<Notebook, StoreError> {
        let user_id: String = row.try_get("user_id")?;
        let notebook_uuid: String = row.try_get("notebook_uuid")?;
        let visible_name: String = row.try_get("visible_name")?;
        let parent_uuid: Option<String> = row.try_get("parent_uuid")?;
        let document_type: String = row.try_get("document_type")?;
        let last_modified: String = row.try_get("last_modified")?;

        Ok(Notebook {
            user_id: UserId::from_str(&user_id)?,
            notebook_uuid: NotebookUuid::from_str(&notebook_uuid)?,
            visible_name,
            parent_uuid: parent_uuid
                .map(|p| NotebookUuid::from_str(&p))
                .transpose()?,
            document_type: DocumentType::parse(&document_type).ok_or_else(|| {
                StoreError::SerializationError(format!("Unknown document type: {document_type}"))
            })?,
            last_modified: parse_ts(&last_modified)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::users::UserRepository;
    use crate::DatabasePool;

    async fn setup() -> (NotebookRepository, UserId) {
        let db = DatabasePool::in_memory().await.unwrap();
        let users = UserRepository::new(db.pool().clone());
        let user = users.find_or_create("oauth|notebooks").await.unwrap();
        (NotebookRepository::new(db.pool().clone()), user.id)
    }

    #[tokio::test]
    async fn test_upsert_and_get() {
        let (repo, user) = setup().await;
        let nb = Notebook::new(user, NotebookUuid::new(), "Field notes");
        repo.upsert(&nb).await.unwrap();

        let loaded = repo.get(&user, &nb.notebook_uuid).await.unwrap().unwrap();
        assert_eq!(loaded.visible_name, "Field notes");

        // Upsert updates in place
        let mut renamed = nb.clone();
        renamed.visible_name = "Field notes 2026".to_string();
        repo.upsert(&renamed).await.unwrap();
        let loaded = repo.get(&user, &nb.notebook_uuid).await.unwrap().unwrap();
        assert_eq!(loaded.visible_name, "Field notes 2026");
    }

    #[tokio::test]
    async fn test_list_sorted_by_name() {
        let (repo, user) = setup().await;
        for name in ["zeta", "alpha", "mid"] {
            repo.upsert(&Notebook::new(user, NotebookUuid::new(), name))
                .await
                .unwrap();
        }
        let listed = repo.list(&user).await.unwrap();
        let names: Vec<&str> = listed.iter().map(|n| n.visible_name.as_str()).collect();
        assert_eq!(names, vec!["alpha", "mid", "zeta"]);
    }

    #[tokio::test]
    async fn test_folder_path() {
        let (repo, user) = setup().await;
        let root = Notebook::new(user, NotebookUuid::new(), "Work")
            .with_document_type(DocumentType::Folder);
        let sub = Notebook::new(user, NotebookUuid::new(), "Projects")
            .with_document_type(DocumentType::Folder)
            .with_parent(root.notebook_uuid);
        let nb = Notebook::new(user, NotebookUuid::new(), "Roadmap").with_parent(sub.notebook_uuid);
        repo.upsert(&root).await.unwrap();
        repo.upsert(&sub).await.unwrap();
        repo.upsert(&nb).await.unwrap();

        let path = repo.folder_path(&user, &nb.notebook_uuid).await.unwrap();
        assert_eq!(path.as_deref(), Some("Work/Projects"));

        let root_path = repo.folder_path(&user, &root.notebook_uuid).await.unwrap();
        assert!(root_path.is_none());
    }
}
