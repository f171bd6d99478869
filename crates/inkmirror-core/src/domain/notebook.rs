//! Notebook domain entity
//!
//! A notebook is the logical container for pages. Notebooks form a tree via
//! `parent_uuid` (folders on the device); parents always belong to the same
//! user.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::newtypes::{NotebookUuid, UserId};

/// Document type as reported by the device manifest
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentType {
    /// A handwritten notebook
    #[default]
    Notebook,
    /// An annotated imported PDF
    Pdf,
    /// An annotated imported EPUB
    Epub,
    /// A folder node (no pages of its own)
    Folder,
}

impl DocumentType {
    /// Stable string form used for persistence
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Notebook => "notebook",
            Self::Pdf => "pdf",
            Self::Epub => "epub",
            Self::Folder => "folder",
        }
    }

    /// Parse the stable string form
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "notebook" => Some(Self::Notebook),
            "pdf" => Some(Self::Pdf),
            "epub" => Some(Self::Epub),
            "folder" => Some(Self::Folder),
            _ => None,
        }
    }
}

/// Logical container for transcribable pages
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notebook {
    /// Owning user
    pub user_id: UserId,
    /// Device-assigned stable identifier
    pub notebook_uuid: NotebookUuid,
    /// Display name from the device manifest
    pub visible_name: String,
    /// Parent folder, if any (same user)
    pub parent_uuid: Option<NotebookUuid>,
    /// Kind of document
    pub document_type: DocumentType,
    /// Device-reported last modification time
    pub last_modified: DateTime<Utc>,
}

impl Notebook {
    /// Creates a notebook record from device metadata
    pub fn new(
        user_id: UserId,
        notebook_uuid: NotebookUuid,
        visible_name: impl Into<String>,
    ) -> Self {
        Self {
            user_id,
            notebook_uuid,
            visible_name: visible_name.into(),
            parent_uuid: None,
            document_type: DocumentType::Notebook,
            last_modified: Utc::now(),
        }
    }

    /// Sets the parent folder
    pub fn with_parent(mut self, parent: NotebookUuid) -> Self {
        self.parent_uuid = Some(parent);
        self
    }

    /// Sets the document type
    pub fn with_document_type(mut self, document_type: DocumentType) -> Self {
        self.document_type = document_type;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notebook_defaults() {
        let nb = Notebook::new(UserId::new(), NotebookUuid::new(), "Lab journal");
        assert_eq!(nb.visible_name, "Lab journal");
        assert_eq!(nb.document_type, DocumentType::Notebook);
        assert!(nb.parent_uuid.is_none());
    }

    #[test]
    fn test_notebook_with_parent() {
        let parent = NotebookUuid::new();
        let nb = Notebook::new(UserId::new(), NotebookUuid::new(), "child").with_parent(parent);
        assert_eq!(nb.parent_uuid, Some(parent));
    }

    #[test]
    fn test_document_type_roundtrip() {
        for dt in [
            DocumentType::Notebook,
            DocumentType::Pdf,
            DocumentType::Epub,
            DocumentType::Folder,
        ] {
            assert_eq!(DocumentType::parse(dt.as_str()), Some(dt));
        }
        assert_eq!(DocumentType::parse("word"), None);
    }
}
