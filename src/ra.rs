//! Contracts between the load engine and the destination repository.

use crate::svn::delta::{DeltaError, DeltaWindow};
use crate::svn::dump::NodeKind;
use crate::svn::props::PropMap;

#[derive(Debug)]
pub(crate) enum TransportError {
    /// An atomic revision property change found a value other than the
    /// expected one.
    PropBaseValueMismatch { rev: u32, name: String },
    NoSuchRevision(u32),
    PathNotFound(String),
    PathExists(String),
    NotADirectory(String),
    NotAFile(String),
    InvalidCopySource(String),
    Delta(DeltaError),
    Other(String),
}

impl From<DeltaError> for TransportError {
    #[inline]
    fn from(e: DeltaError) -> Self {
        Self::Delta(e)
    }
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PropBaseValueMismatch { rev, name } => write!(
                f,
                "revision property {name:?} on r{rev} does not have the expected value",
            ),
            Self::NoSuchRevision(rev) => write!(f, "no such revision r{rev}"),
            Self::PathNotFound(path) => write!(f, "path not found: {path:?}"),
            Self::PathExists(path) => write!(f, "path already exists: {path:?}"),
            Self::NotADirectory(path) => write!(f, "not a directory: {path:?}"),
            Self::NotAFile(path) => write!(f, "not a file: {path:?}"),
            Self::InvalidCopySource(url) => write!(f, "invalid copy source: {url:?}"),
            Self::Delta(e) => write!(f, "failed to apply delta: {e}"),
            Self::Other(msg) => f.write_str(msg),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct CopySource {
    pub(crate) url: String,
    pub(crate) rev: u32,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct CommitInfo {
    pub(crate) revision: u32,
}

/// Consumes the windows of a text delta. `None` marks the end of the delta.
pub(crate) trait WindowHandler {
    fn handle_window(&mut self, window: Option<&DeltaWindow>) -> Result<(), TransportError>;
}

/// Hierarchical tree edit of a single transaction.
///
/// Directory and file handles are opened relative to an open parent and
/// must be closed before their parent. Paths are relative to the
/// repository root.
pub(crate) trait CommitEditor {
    type Dir;
    type File;
    type TextDelta: WindowHandler;

    fn open_root(&mut self, base_rev: u32) -> Result<Self::Dir, TransportError>;

    fn delete_entry(
        &mut self,
        path: &str,
        rev: u32,
        parent: &mut Self::Dir,
    ) -> Result<(), TransportError>;

    fn add_directory(
        &mut self,
        path: &str,
        parent: &mut Self::Dir,
        copy_from: Option<CopySource>,
    ) -> Result<Self::Dir, TransportError>;

    fn open_directory(
        &mut self,
        path: &str,
        parent: &mut Self::Dir,
        base_rev: u32,
    ) -> Result<Self::Dir, TransportError>;

    fn change_dir_prop(
        &mut self,
        dir: &mut Self::Dir,
        name: &str,
        value: Option<&[u8]>,
    ) -> Result<(), TransportError>;

    fn close_directory(&mut self, dir: Self::Dir) -> Result<(), TransportError>;

    fn add_file(
        &mut self,
        path: &str,
        parent: &mut Self::Dir,
        copy_from: Option<CopySource>,
    ) -> Result<Self::File, TransportError>;

    fn open_file(
        &mut self,
        path: &str,
        parent: &mut Self::Dir,
        base_rev: u32,
    ) -> Result<Self::File, TransportError>;

    fn change_file_prop(
        &mut self,
        file: &mut Self::File,
        name: &str,
        value: Option<&[u8]>,
    ) -> Result<(), TransportError>;

    fn apply_textdelta(
        &mut self,
        file: &mut Self::File,
        base_checksum: Option<&str>,
    ) -> Result<Self::TextDelta, TransportError>;

    fn close_file(&mut self, file: Self::File) -> Result<(), TransportError>;

    fn close_edit(self) -> Result<CommitInfo, TransportError>;

    fn abort_edit(self) -> Result<(), TransportError>;
}

/// Connection to a destination repository.
pub(crate) trait Session {
    type Editor: CommitEditor;

    fn has_atomic_revprops(&self) -> Result<bool, TransportError>;

    fn repos_root(&self) -> &str;

    fn head_revision(&self) -> Result<u32, TransportError>;

    fn rev_prop(&self, rev: u32, name: &str) -> Result<Option<Vec<u8>>, TransportError>;

    /// Sets (or deletes, when `value` is `None`) a revision property.
    ///
    /// With `expected_old` set, the change only happens when the current
    /// value matches it (`Some(None)` meaning absent), failing with
    /// `PropBaseValueMismatch` otherwise. It must only be used when
    /// `has_atomic_revprops` is true.
    fn change_rev_prop(
        &mut self,
        rev: u32,
        name: &str,
        expected_old: Option<Option<&[u8]>>,
        value: Option<&[u8]>,
    ) -> Result<(), TransportError>;

    /// Regular properties of the node at `path` in revision `rev`.
    fn node_props(&self, path: &str, rev: u32, kind: NodeKind)
    -> Result<PropMap, TransportError>;

    /// Starts a transaction that, once closed, becomes a revision with
    /// `revprops`.
    fn commit_editor(&mut self, revprops: PropMap) -> Result<Self::Editor, TransportError>;
}

/// Receives a notification for each loaded revision.
pub(crate) trait Notify {
    fn revision_loaded(&mut self, rev: u32);
}

impl<F: FnMut(u32)> Notify for F {
    fn revision_loaded(&mut self, rev: u32) {
        self(rev);
    }
}
