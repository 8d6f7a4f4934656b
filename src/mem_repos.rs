//! Versioned repository kept in memory.
//!
//! Every revision owns a root directory. Trees are persistent: a commit
//! copies only the directories on the paths it touches and shares every
//! other node with the revision it is based on.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use crate::load::reconcile::{basename, components, dirname};
use crate::ra::{CommitEditor, CommitInfo, CopySource, Session, TransportError, WindowHandler};
use crate::svn::delta::DeltaWindow;
use crate::svn::dump::NodeKind;
use crate::svn::props::{PROP_REVISION_AUTHOR, PROP_REVISION_DATE, PropMap};

pub(crate) const DEFAULT_ROOT_URL: &str = "mem:///repos";

const COMMITTER: &str = "svnload";

#[derive(Clone, Debug, Default)]
struct DirNode {
    props: PropMap,
    entries: BTreeMap<String, Node>,
}

#[derive(Clone, Debug)]
struct FileNode {
    props: PropMap,
    content: Rc<[u8]>,
}

impl FileNode {
    fn empty() -> Self {
        Self {
            props: PropMap::new(),
            content: Rc::from(Vec::new()),
        }
    }
}

#[derive(Clone, Debug)]
enum Node {
    Dir(Rc<DirNode>),
    File(Rc<FileNode>),
}

impl Node {
    fn kind(&self) -> NodeKind {
        match self {
            Self::Dir(_) => NodeKind::Dir,
            Self::File(_) => NodeKind::File,
        }
    }

    fn props(&self) -> &PropMap {
        match self {
            Self::Dir(dir) => &dir.props,
            Self::File(file) => &file.props,
        }
    }
}

struct Revision {
    root: Rc<DirNode>,
    props: PropMap,
}

struct ReposInner {
    revisions: Vec<Revision>,
    atomic_revprops: bool,
}

impl ReposInner {
    fn head(&self) -> u32 {
        // revision 0 always exists
        u32::try_from(self.revisions.len() - 1).unwrap_or(u32::MAX)
    }

    fn revision(&self, rev: u32) -> Result<&Revision, TransportError> {
        usize::try_from(rev)
            .ok()
            .and_then(|i| self.revisions.get(i))
            .ok_or(TransportError::NoSuchRevision(rev))
    }

    fn revision_mut(&mut self, rev: u32) -> Result<&mut Revision, TransportError> {
        usize::try_from(rev)
            .ok()
            .and_then(|i| self.revisions.get_mut(i))
            .ok_or(TransportError::NoSuchRevision(rev))
    }
}

fn find_node(root: &Rc<DirNode>, path: &str) -> Option<Node> {
    let mut node = Node::Dir(root.clone());
    for name in components(path) {
        let Node::Dir(dir) = node else {
            return None;
        };
        node = dir.entries.get(name)?.clone();
    }
    Some(node)
}

/// Walks down to the directory at `path`, unsharing every directory on
/// the way.
fn dir_mut<'t>(root: &'t mut Rc<DirNode>, path: &str) -> Result<&'t mut DirNode, TransportError> {
    let mut dir = Rc::make_mut(root);
    for name in components(path) {
        dir = match dir.entries.get_mut(name) {
            Some(Node::Dir(child)) => Rc::make_mut(child),
            Some(Node::File(_)) => return Err(TransportError::NotADirectory(path.to_string())),
            None => return Err(TransportError::PathNotFound(path.to_string())),
        };
    }
    Ok(dir)
}

fn file_mut<'t>(root: &'t mut Rc<DirNode>, path: &str) -> Result<&'t mut FileNode, TransportError> {
    let parent = dir_mut(root, dirname(path))?;
    match parent.entries.get_mut(basename(path)) {
        Some(Node::File(file)) => Ok(Rc::make_mut(file)),
        Some(Node::Dir(_)) => Err(TransportError::NotAFile(path.to_string())),
        None => Err(TransportError::PathNotFound(path.to_string())),
    }
}

fn set_prop(props: &mut PropMap, name: &str, value: Option<&[u8]>) {
    match value {
        Some(value) => {
            props.insert(name.to_string(), value.to_vec());
        }
        None => {
            props.remove(name);
        }
    }
}

pub(crate) struct MemRepos {
    inner: Rc<RefCell<ReposInner>>,
    root_url: String,
}

impl MemRepos {
    /// Creates a repository with an empty revision 0.
    pub(crate) fn new(root_url: &str) -> Self {
        let mut r0_props = PropMap::new();
        r0_props.insert(PROP_REVISION_DATE.into(), now_datestamp());
        Self {
            inner: Rc::new(RefCell::new(ReposInner {
                revisions: vec![Revision {
                    root: Rc::default(),
                    props: r0_props,
                }],
                atomic_revprops: true,
            })),
            root_url: root_url.trim_end_matches('/').to_string(),
        }
    }

    pub(crate) fn set_atomic_revprops(&mut self, atomic: bool) {
        self.inner.borrow_mut().atomic_revprops = atomic;
    }

    pub(crate) fn head(&self) -> u32 {
        self.inner.borrow().head()
    }

    /// Writes the files and directories of the head revision under `dest`,
    /// which is created if needed.
    pub(crate) fn export_head(&self, dest: &std::path::Path) -> Result<(), std::io::Error> {
        let inner = self.inner.borrow();
        let head = inner.head();
        let root = inner.revision(head).map(|r| r.root.clone()).ok();
        drop(inner);

        std::fs::create_dir_all(dest)?;
        if let Some(root) = root {
            export_dir(&root, dest)?;
        }
        tracing::info!("exported r{head} to {dest:?}");
        Ok(())
    }

    #[cfg(test)]
    fn file_content(&self, path: &str, rev: u32) -> Option<Vec<u8>> {
        let inner = self.inner.borrow();
        match find_node(&inner.revision(rev).ok()?.root, path)? {
            Node::File(file) => Some(file.content.to_vec()),
            Node::Dir(_) => None,
        }
    }

    #[cfg(test)]
    fn entries(&self, path: &str, rev: u32) -> Option<Vec<String>> {
        let inner = self.inner.borrow();
        match find_node(&inner.revision(rev).ok()?.root, path)? {
            Node::Dir(dir) => Some(dir.entries.keys().cloned().collect()),
            Node::File(_) => None,
        }
    }
}

fn export_dir(dir: &DirNode, dest: &std::path::Path) -> Result<(), std::io::Error> {
    for (name, node) in dir.entries.iter() {
        let path = dest.join(name);
        match node {
            Node::Dir(child) => {
                std::fs::create_dir_all(&path)?;
                export_dir(child, &path)?;
            }
            Node::File(file) => std::fs::write(&path, &file.content)?,
        }
    }
    Ok(())
}

fn now_datestamp() -> Vec<u8> {
    chrono::Utc::now()
        .format("%Y-%m-%dT%H:%M:%S%.6fZ")
        .to_string()
        .into_bytes()
}

impl Session for MemRepos {
    type Editor = MemEditor;

    fn has_atomic_revprops(&self) -> Result<bool, TransportError> {
        Ok(self.inner.borrow().atomic_revprops)
    }

    fn repos_root(&self) -> &str {
        &self.root_url
    }

    fn head_revision(&self) -> Result<u32, TransportError> {
        Ok(self.inner.borrow().head())
    }

    fn rev_prop(&self, rev: u32, name: &str) -> Result<Option<Vec<u8>>, TransportError> {
        let inner = self.inner.borrow();
        Ok(inner.revision(rev)?.props.get(name).cloned())
    }

    fn change_rev_prop(
        &mut self,
        rev: u32,
        name: &str,
        expected_old: Option<Option<&[u8]>>,
        value: Option<&[u8]>,
    ) -> Result<(), TransportError> {
        let mut inner = self.inner.borrow_mut();
        if expected_old.is_some() && !inner.atomic_revprops {
            return Err(TransportError::Other(
                "atomic revision property changes are not supported".into(),
            ));
        }

        let revision = inner.revision_mut(rev)?;
        if let Some(expected_old) = expected_old {
            if revision.props.get(name).map(Vec::as_slice) != expected_old {
                return Err(TransportError::PropBaseValueMismatch {
                    rev,
                    name: name.to_string(),
                });
            }
        }
        set_prop(&mut revision.props, name, value);
        Ok(())
    }

    fn node_props(
        &self,
        path: &str,
        rev: u32,
        kind: NodeKind,
    ) -> Result<PropMap, TransportError> {
        let inner = self.inner.borrow();
        let node = find_node(&inner.revision(rev)?.root, path)
            .ok_or_else(|| TransportError::PathNotFound(format!("{path}@{rev}")))?;
        match (kind, node.kind()) {
            (NodeKind::Dir, NodeKind::File) => Err(TransportError::NotADirectory(path.into())),
            (NodeKind::File, NodeKind::Dir) => Err(TransportError::NotAFile(path.into())),
            _ => Ok(node.props().clone()),
        }
    }

    fn commit_editor(&mut self, revprops: PropMap) -> Result<MemEditor, TransportError> {
        Ok(MemEditor {
            inner: self.inner.clone(),
            root_url: self.root_url.clone(),
            revprops,
            txn_root: None,
        })
    }
}

/// Transaction on a [`MemRepos`]. Changes are applied to a private copy of
/// the head tree as they arrive.
pub(crate) struct MemEditor {
    inner: Rc<RefCell<ReposInner>>,
    root_url: String,
    revprops: PropMap,
    txn_root: Option<Rc<DirNode>>,
}

pub(crate) struct MemDir {
    path: String,
}

pub(crate) struct MemFile {
    path: String,
    /// New content, once a text delta has been completely applied.
    text: Rc<RefCell<Option<Vec<u8>>>>,
}

impl MemEditor {
    fn txn_root(&mut self) -> Result<&mut Rc<DirNode>, TransportError> {
        self.txn_root
            .as_mut()
            .ok_or_else(|| TransportError::Other("root of the edit is not open".into()))
    }

    fn check_base_rev(&self, base_rev: u32) -> Result<(), TransportError> {
        if base_rev > self.inner.borrow().head() {
            return Err(TransportError::NoSuchRevision(base_rev));
        }
        Ok(())
    }

    /// Resolves a copy source URL to the node it points to.
    fn copy_source(&self, source: &CopySource) -> Result<Node, TransportError> {
        let path = match source.url.strip_prefix(self.root_url.as_str()) {
            Some("") => "",
            Some(rest) => rest
                .strip_prefix('/')
                .ok_or_else(|| TransportError::InvalidCopySource(source.url.clone()))?,
            None => return Err(TransportError::InvalidCopySource(source.url.clone())),
        };
        let inner = self.inner.borrow();
        find_node(&inner.revision(source.rev)?.root, path)
            .ok_or_else(|| TransportError::PathNotFound(format!("{path}@{}", source.rev)))
    }

    fn add_node(&mut self, path: &str, parent: &MemDir, node: Node) -> Result<(), TransportError> {
        check_parent(path, parent)?;
        let dir = dir_mut(self.txn_root()?, &parent.path)?;
        match dir.entries.entry(basename(path).to_string()) {
            std::collections::btree_map::Entry::Occupied(_) => {
                Err(TransportError::PathExists(path.to_string()))
            }
            std::collections::btree_map::Entry::Vacant(entry) => {
                entry.insert(node);
                Ok(())
            }
        }
    }

    fn existing_node(&mut self, path: &str) -> Result<Node, TransportError> {
        let root = self.txn_root()?;
        find_node(root, path).ok_or_else(|| TransportError::PathNotFound(path.to_string()))
    }
}

fn check_parent(path: &str, parent: &MemDir) -> Result<(), TransportError> {
    if path.is_empty() || dirname(path) != parent.path {
        return Err(TransportError::Other(format!(
            "{path:?} is not a child of {:?}",
            parent.path,
        )));
    }
    Ok(())
}

impl CommitEditor for MemEditor {
    type Dir = MemDir;
    type File = MemFile;
    type TextDelta = MemTextDelta;

    fn open_root(&mut self, base_rev: u32) -> Result<MemDir, TransportError> {
        self.check_base_rev(base_rev)?;
        let inner = self.inner.borrow();
        let head = inner.head();
        let root = inner.revision(head)?.root.clone();
        drop(inner);
        self.txn_root = Some(root);
        Ok(MemDir {
            path: String::new(),
        })
    }

    fn delete_entry(
        &mut self,
        path: &str,
        rev: u32,
        parent: &mut MemDir,
    ) -> Result<(), TransportError> {
        self.check_base_rev(rev)?;
        check_parent(path, parent)?;
        let dir = dir_mut(self.txn_root()?, &parent.path)?;
        dir.entries
            .remove(basename(path))
            .map(|_| ())
            .ok_or_else(|| TransportError::PathNotFound(path.to_string()))
    }

    fn add_directory(
        &mut self,
        path: &str,
        parent: &mut MemDir,
        copy_from: Option<CopySource>,
    ) -> Result<MemDir, TransportError> {
        let node = match copy_from {
            Some(source) => {
                let node = self.copy_source(&source)?;
                if !matches!(node, Node::Dir(_)) {
                    return Err(TransportError::NotADirectory(source.url));
                }
                node
            }
            None => Node::Dir(Rc::default()),
        };
        self.add_node(path, parent, node)?;
        Ok(MemDir {
            path: path.to_string(),
        })
    }

    fn open_directory(
        &mut self,
        path: &str,
        parent: &mut MemDir,
        base_rev: u32,
    ) -> Result<MemDir, TransportError> {
        self.check_base_rev(base_rev)?;
        check_parent(path, parent)?;
        match self.existing_node(path)? {
            Node::Dir(_) => Ok(MemDir {
                path: path.to_string(),
            }),
            Node::File(_) => Err(TransportError::NotADirectory(path.to_string())),
        }
    }

    fn change_dir_prop(
        &mut self,
        dir: &mut MemDir,
        name: &str,
        value: Option<&[u8]>,
    ) -> Result<(), TransportError> {
        let node = dir_mut(self.txn_root()?, &dir.path)?;
        set_prop(&mut node.props, name, value);
        Ok(())
    }

    fn close_directory(&mut self, _dir: MemDir) -> Result<(), TransportError> {
        Ok(())
    }

    fn add_file(
        &mut self,
        path: &str,
        parent: &mut MemDir,
        copy_from: Option<CopySource>,
    ) -> Result<MemFile, TransportError> {
        let node = match copy_from {
            Some(source) => {
                let node = self.copy_source(&source)?;
                if !matches!(node, Node::File(_)) {
                    return Err(TransportError::NotAFile(source.url));
                }
                node
            }
            None => Node::File(Rc::new(FileNode::empty())),
        };
        self.add_node(path, parent, node)?;
        Ok(MemFile {
            path: path.to_string(),
            text: Rc::default(),
        })
    }

    fn open_file(
        &mut self,
        path: &str,
        parent: &mut MemDir,
        base_rev: u32,
    ) -> Result<MemFile, TransportError> {
        self.check_base_rev(base_rev)?;
        check_parent(path, parent)?;
        match self.existing_node(path)? {
            Node::File(_) => Ok(MemFile {
                path: path.to_string(),
                text: Rc::default(),
            }),
            Node::Dir(_) => Err(TransportError::NotAFile(path.to_string())),
        }
    }

    fn change_file_prop(
        &mut self,
        file: &mut MemFile,
        name: &str,
        value: Option<&[u8]>,
    ) -> Result<(), TransportError> {
        let node = file_mut(self.txn_root()?, &file.path)?;
        set_prop(&mut node.props, name, value);
        Ok(())
    }

    fn apply_textdelta(
        &mut self,
        file: &mut MemFile,
        base_checksum: Option<&str>,
    ) -> Result<MemTextDelta, TransportError> {
        if let Some(base_checksum) = base_checksum {
            tracing::trace!("delta base of {:?} is {base_checksum}", file.path);
        }
        let base = match self.existing_node(&file.path)? {
            Node::File(node) => node.content.clone(),
            Node::Dir(_) => return Err(TransportError::NotAFile(file.path.clone())),
        };
        Ok(MemTextDelta {
            base,
            target: Vec::new(),
            result: file.text.clone(),
        })
    }

    fn close_file(&mut self, file: MemFile) -> Result<(), TransportError> {
        let text = file.text.borrow_mut().take();
        if let Some(text) = text {
            file_mut(self.txn_root()?, &file.path)?.content = Rc::from(text);
        }
        Ok(())
    }

    fn close_edit(mut self) -> Result<CommitInfo, TransportError> {
        let root = self.txn_root.take().ok_or_else(|| {
            TransportError::Other("edit closed without opening its root".into())
        })?;

        let mut props = std::mem::take(&mut self.revprops);
        props.insert(PROP_REVISION_DATE.into(), now_datestamp());
        props.insert(PROP_REVISION_AUTHOR.into(), COMMITTER.into());

        let mut inner = self.inner.borrow_mut();
        let revision = inner.head() + 1;
        inner.revisions.push(Revision { root, props });
        tracing::debug!("committed r{revision}");
        Ok(CommitInfo { revision })
    }

    fn abort_edit(self) -> Result<(), TransportError> {
        tracing::debug!("transaction aborted");
        Ok(())
    }
}

/// Rebuilds the content of a file from its previous content and a stream
/// of delta windows.
pub(crate) struct MemTextDelta {
    base: Rc<[u8]>,
    target: Vec<u8>,
    result: Rc<RefCell<Option<Vec<u8>>>>,
}

impl WindowHandler for MemTextDelta {
    fn handle_window(&mut self, window: Option<&DeltaWindow>) -> Result<(), TransportError> {
        match window {
            Some(window) => window.apply(&self.base, &mut self.target)?,
            None => *self.result.borrow_mut() = Some(std::mem::take(&mut self.target)),
        }
        Ok(())
    }
}
