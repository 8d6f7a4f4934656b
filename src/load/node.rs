use std::io::Read;

use super::LoadError;
use super::reconcile::{DirStack, dirname};
use crate::ra::{CommitEditor, CopySource, Session, WindowHandler as _};
use crate::svn::delta::{WindowReader, fulltext_windows};
use crate::svn::dump::{self, NodeAction};
use crate::svn::props::{self, PropKind};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum NodeKind {
    File,
    Dir,
    Unknown,
}

impl From<Option<dump::NodeKind>> for NodeKind {
    fn from(kind: Option<dump::NodeKind>) -> Self {
        match kind {
            Some(dump::NodeKind::File) => Self::File,
            Some(dump::NodeKind::Dir) => Self::Dir,
            None => Self::Unknown,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct CopyFrom {
    pub(crate) path: String,
    /// Already translated to destination numbering.
    pub(crate) rev: u32,
}

#[derive(Clone, Debug)]
pub(crate) struct NodeRecord {
    pub(crate) path: String,
    pub(crate) kind: NodeKind,
    pub(crate) action: NodeAction,
    pub(crate) copy_from: Option<CopyFrom>,
    pub(crate) base_checksum: Option<String>,
}

pub(crate) struct NodeState<F> {
    pub(crate) record: NodeRecord,
    pub(crate) file: Option<F>,
    /// The directory on top of the stack is the node itself.
    pub(crate) dir_on_top: bool,
}

impl<F> NodeState<F> {
    /// Whether the node is open for property changes. Deleted nodes and
    /// nodes without a kind are not.
    fn has_props(&self) -> bool {
        self.file.is_some() || self.dir_on_top
    }
}

/// Brings the directory the node acts on to the top of the stack and
/// performs its action.
pub(crate) fn open_node<E: CommitEditor>(
    editor: &mut E,
    stack: &mut DirStack<E::Dir>,
    record: NodeRecord,
    root_url: &str,
    base_rev: u32,
) -> Result<NodeState<E::File>, LoadError> {
    let path = record.path.as_str();

    // A changed directory is edited in place, everything else inside its
    // parent.
    let target = if record.action == NodeAction::Change && record.kind == NodeKind::Dir {
        path
    } else {
        dirname(path)
    };
    stack.reconcile(editor, target, base_rev)?;

    let copy_source = record.copy_from.as_ref().map(|copy_from| CopySource {
        url: format!("{root_url}/{}", copy_from.path),
        rev: copy_from.rev,
    });

    let mut file = None;
    let mut dir_on_top = false;
    match record.action {
        NodeAction::Delete => {
            tracing::trace!("delete_entry({path:?})");
            editor.delete_entry(path, base_rev, &mut stack.top_mut().handle)?;
        }
        NodeAction::Add | NodeAction::Replace => {
            if record.action == NodeAction::Replace {
                tracing::trace!("delete_entry({path:?})");
                editor.delete_entry(path, base_rev, &mut stack.top_mut().handle)?;
            }
            match record.kind {
                NodeKind::File => {
                    tracing::trace!("add_file({path:?}, {copy_source:?})");
                    file = Some(editor.add_file(path, &mut stack.top_mut().handle, copy_source)?);
                }
                NodeKind::Dir => {
                    tracing::trace!("add_directory({path:?}, {copy_source:?})");
                    let dir =
                        editor.add_directory(path, &mut stack.top_mut().handle, copy_source)?;
                    stack.push(dir, path.to_string());
                    dir_on_top = true;
                }
                NodeKind::Unknown => {
                    tracing::debug!("ignoring {:?} of {path:?} without kind", record.action);
                }
            }
        }
        NodeAction::Change => match record.kind {
            NodeKind::File => {
                tracing::trace!("open_file({path:?})");
                file = Some(editor.open_file(path, &mut stack.top_mut().handle, base_rev)?);
            }
            NodeKind::Dir => dir_on_top = true,
            NodeKind::Unknown => {
                tracing::debug!("ignoring change of {path:?} without kind");
            }
        },
    }

    Ok(NodeState {
        record,
        file,
        dir_on_top,
    })
}

/// Sets (or deletes, with `None`) a property of the node, on its file or
/// its directory. Nodes that are not open for property changes ignore it.
pub(crate) fn change_prop<E: CommitEditor>(
    editor: &mut E,
    stack: &mut DirStack<E::Dir>,
    node: &mut NodeState<E::File>,
    name: &str,
    value: Option<&[u8]>,
    check_props: bool,
) -> Result<(), LoadError> {
    if check_props {
        props::validate(name, value).map_err(|reason| LoadError::InvalidProperty {
            name: name.to_string(),
            reason,
        })?;
    }

    if let Some(ref mut file) = node.file {
        tracing::trace!("change_file_prop({:?}, {name:?})", node.record.path);
        editor.change_file_prop(file, name, value)?;
    } else if node.dir_on_top {
        let top = stack.top_mut();
        tracing::trace!("change_dir_prop({:?}, {name:?})", top.relpath);
        editor.change_dir_prop(&mut top.handle, name, value)?;
    } else {
        tracing::trace!(
            "ignoring property {name:?} of {:?} {:?}",
            node.record.action,
            node.record.path,
        );
    }
    Ok(())
}

/// Deletes the properties the node had before, so the ones that follow
/// replace them.
pub(crate) fn remove_node_props<S: Session>(
    session: &S,
    editor: &mut S::Editor,
    stack: &mut DirStack<<S::Editor as CommitEditor>::Dir>,
    node: &mut NodeState<<S::Editor as CommitEditor>::File>,
    base_rev: u32,
    check_props: bool,
) -> Result<(), LoadError> {
    let record = &node.record;
    if !node.has_props() {
        return Ok(());
    }
    if matches!(record.action, NodeAction::Add | NodeAction::Replace) && record.copy_from.is_none()
    {
        // Added without history, there is nothing to remove.
        return Ok(());
    }

    let (path, rev) = match record.copy_from {
        Some(ref copy_from) => (copy_from.path.as_str(), copy_from.rev),
        None => (record.path.as_str(), base_rev),
    };
    let kind = match record.kind {
        NodeKind::File => dump::NodeKind::File,
        NodeKind::Dir | NodeKind::Unknown => dump::NodeKind::Dir,
    };
    let old_props = session.node_props(path, rev, kind)?;

    for name in old_props.keys() {
        if PropKind::of(name) == PropKind::Regular {
            change_prop(editor, stack, node, name, None, check_props)?;
        }
    }
    Ok(())
}

fn open_file_text<'f, F>(node: &'f mut NodeState<F>) -> Result<&'f mut F, LoadError> {
    let path = &node.record.path;
    node.file.as_mut().ok_or_else(|| {
        LoadError::MalformedDumpOrder(format!("text for {path:?} which is not an open file"))
    })
}

/// Sends a full text as a delta against an empty source.
pub(crate) fn set_fulltext<E: CommitEditor>(
    editor: &mut E,
    node: &mut NodeState<E::File>,
    text: &mut dyn Read,
) -> Result<(), LoadError> {
    let base_checksum = node.record.base_checksum.clone();
    let file = open_file_text(node)?;
    let mut handler = editor.apply_textdelta(file, base_checksum.as_deref())?;
    fulltext_windows(text, |window| {
        handler.handle_window(Some(&window))?;
        Ok::<_, LoadError>(())
    })?;
    handler.handle_window(None)?;
    Ok(())
}

pub(crate) fn apply_textdelta<E: CommitEditor, R: Read>(
    editor: &mut E,
    node: &mut NodeState<E::File>,
    windows: &mut WindowReader<R>,
) -> Result<(), LoadError> {
    let base_checksum = node.record.base_checksum.clone();
    let file = open_file_text(node)?;
    let mut handler = editor.apply_textdelta(file, base_checksum.as_deref())?;
    while let Some(window) = windows
        .next_window()
        .map_err(|e| LoadError::Dump(dump::ReadError::BrokenDelta(e)))?
    {
        handler.handle_window(Some(&window))?;
    }
    handler.handle_window(None)?;
    Ok(())
}

pub(crate) fn close_node<E: CommitEditor>(
    editor: &mut E,
    node: NodeState<E::File>,
) -> Result<(), LoadError> {
    if let Some(file) = node.file {
        tracing::trace!("close_file({:?})", node.record.path);
        editor.close_file(file)?;
    }
    Ok(())
}
