use std::path::{Path, PathBuf};

use crate::protocol::{FileKind, FileReference};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadState {
    Selected,
    Uploading,
    Uploaded(String),
    Failed(String),
}

/// A local file picked for the next message.
#[derive(Debug, Clone)]
pub struct PendingFile {
    path: PathBuf,
    name: String,
    mime: String,
    kind: FileKind,
    state: UploadState,
}

impl PendingFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "upload".to_string());
        let mime = infer_mime_type(&path);
        let kind = FileKind::from_mime(&mime);
        Self {
            path,
            name,
            mime,
            kind,
            state: UploadState::Selected,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mime(&self) -> &str {
        &self.mime
    }

    pub fn kind(&self) -> FileKind {
        self.kind
    }

    pub fn state(&self) -> &UploadState {
        &self.state
    }

    pub fn uploaded_id(&self) -> Option<&str> {
        match &self.state {
            UploadState::Uploaded(id) => Some(id),
            _ => None,
        }
    }

    pub fn reference(&self) -> Option<FileReference> {
        self.uploaded_id()
            .map(|id| FileReference::uploaded(self.kind, id))
    }

    pub(crate) fn needs_upload(&self) -> bool {
        matches!(self.state, UploadState::Selected | UploadState::Failed(_))
    }

    pub(crate) fn mark_uploading(&mut self) {
        self.state = UploadState::Uploading;
    }

    pub(crate) fn mark_uploaded(&mut self, file_id: String) {
        self.state = UploadState::Uploaded(file_id);
    }

    pub(crate) fn mark_failed(&mut self, reason: String) {
        self.state = UploadState::Failed(reason);
    }
}

/// Files waiting to be attached to the next message.
#[derive(Debug, Clone, Default)]
pub struct PendingFiles {
    files: Vec<PendingFile>,
}

impl PendingFiles {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, path: impl Into<PathBuf>) -> &PendingFile {
        self.files.push(PendingFile::new(path));
        &self.files[self.files.len() - 1]
    }

    pub fn remove(&mut self, index: usize) -> Option<PendingFile> {
        (index < self.files.len()).then(|| self.files.remove(index))
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PendingFile> {
        self.files.iter()
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut PendingFile> {
        self.files.iter_mut()
    }

    pub fn all_uploaded(&self) -> bool {
        self.files.iter().all(|file| file.uploaded_id().is_some())
    }

    /// References for every uploaded file, in selection order.
    pub fn references(&self) -> Vec<FileReference> {
        self.files.iter().filter_map(PendingFile::reference).collect()
    }

    /// Drops every file once the message carrying them was sent.
    pub fn clear(&mut self) {
        self.files.clear();
    }
}

fn infer_mime_type(path: &Path) -> String {
    mime_guess::from_path(path)
        .first_or_octet_stream()
        .to_string()
}
