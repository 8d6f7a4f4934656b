//! Destination that records the calls it receives.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use crate::ra::{CommitEditor, CommitInfo, CopySource, Session, TransportError, WindowHandler};
use crate::svn::delta::DeltaWindow;
use crate::svn::dump::NodeKind;
use crate::svn::props::PropMap;

struct State {
    log: Vec<String>,
    atomic: bool,
    head: u32,
    revprops: BTreeMap<u32, PropMap>,
    node_props: PropMap,
    fail_on: Option<&'static str>,
}

impl State {
    fn record(&mut self, entry: String) -> Result<(), TransportError> {
        let fail = self.fail_on.is_some_and(|prefix| entry.starts_with(prefix));
        self.log.push(entry);
        if fail {
            Err(TransportError::Other("injected failure".into()))
        } else {
            Ok(())
        }
    }
}

fn value_str(value: Option<&[u8]>) -> String {
    match value {
        Some(value) => value.escape_ascii().to_string(),
        None => "<delete>".into(),
    }
}

pub(crate) struct RecSession {
    state: Rc<RefCell<State>>,
}

impl RecSession {
    pub(crate) fn new() -> Self {
        Self {
            state: Rc::new(RefCell::new(State {
                log: Vec::new(),
                atomic: true,
                head: 0,
                revprops: BTreeMap::from([(0, PropMap::new())]),
                node_props: PropMap::new(),
                fail_on: None,
            })),
        }
    }

    pub(crate) fn take_log(&self) -> Vec<String> {
        std::mem::take(&mut self.state.borrow_mut().log)
    }

    pub(crate) fn set_atomic(&self, atomic: bool) {
        self.state.borrow_mut().atomic = atomic;
    }

    pub(crate) fn set_head(&self, head: u32) {
        let mut state = self.state.borrow_mut();
        state.head = head;
        for rev in 0..=head {
            state.revprops.entry(rev).or_default();
        }
    }

    /// Calls whose log entry starts with `prefix` fail after being logged.
    pub(crate) fn fail_on(&self, prefix: &'static str) {
        self.state.borrow_mut().fail_on = Some(prefix);
    }

    /// Properties returned for any node.
    pub(crate) fn set_node_props(&self, props: &[(&str, &str)]) {
        self.state.borrow_mut().node_props = props
            .iter()
            .map(|&(name, value)| (name.to_string(), value.as_bytes().to_vec()))
            .collect();
    }

    /// Sets a revision property without logging it.
    pub(crate) fn set_rev_prop(&self, rev: u32, name: &str, value: &[u8]) {
        self.state
            .borrow_mut()
            .revprops
            .entry(rev)
            .or_default()
            .insert(name.to_string(), value.to_vec());
    }

    pub(crate) fn revprops(&self, rev: u32) -> PropMap {
        self.state
            .borrow()
            .revprops
            .get(&rev)
            .cloned()
            .unwrap_or_default()
    }
}

impl Session for RecSession {
    type Editor = RecEditor;

    fn has_atomic_revprops(&self) -> Result<bool, TransportError> {
        Ok(self.state.borrow().atomic)
    }

    fn repos_root(&self) -> &str {
        "mem:///rec"
    }

    fn head_revision(&self) -> Result<u32, TransportError> {
        Ok(self.state.borrow().head)
    }

    fn rev_prop(&self, rev: u32, name: &str) -> Result<Option<Vec<u8>>, TransportError> {
        let state = self.state.borrow();
        let revprops = state
            .revprops
            .get(&rev)
            .ok_or(TransportError::NoSuchRevision(rev))?;
        Ok(revprops.get(name).cloned())
    }

    fn change_rev_prop(
        &mut self,
        rev: u32,
        name: &str,
        expected_old: Option<Option<&[u8]>>,
        value: Option<&[u8]>,
    ) -> Result<(), TransportError> {
        let mut state = self.state.borrow_mut();
        state.record(format!(
            "change_rev_prop(r{rev}, {name}, {})",
            value_str(value),
        ))?;
        let revprops = state
            .revprops
            .get_mut(&rev)
            .ok_or(TransportError::NoSuchRevision(rev))?;
        if let Some(expected_old) = expected_old {
            if revprops.get(name).map(Vec::as_slice) != expected_old {
                return Err(TransportError::PropBaseValueMismatch {
                    rev,
                    name: name.to_string(),
                });
            }
        }
        match value {
            Some(value) => {
                revprops.insert(name.to_string(), value.to_vec());
            }
            None => {
                revprops.remove(name);
            }
        }
        Ok(())
    }

    fn node_props(
        &self,
        path: &str,
        rev: u32,
        _kind: NodeKind,
    ) -> Result<PropMap, TransportError> {
        let mut state = self.state.borrow_mut();
        state.record(format!("node_props({path}, r{rev})"))?;
        Ok(state.node_props.clone())
    }

    fn commit_editor(&mut self, revprops: PropMap) -> Result<RecEditor, TransportError> {
        let names = revprops.keys().map(String::as_str).collect::<Vec<_>>();
        self.state
            .borrow_mut()
            .record(format!("commit_editor({})", names.join(", ")))?;
        Ok(RecEditor {
            state: self.state.clone(),
            revprops,
        })
    }
}

pub(crate) struct RecEditor {
    state: Rc<RefCell<State>>,
    revprops: PropMap,
}

impl RecEditor {
    fn record(&self, entry: String) -> Result<(), TransportError> {
        self.state.borrow_mut().record(entry)
    }
}

fn copy_str(copy_from: Option<&CopySource>) -> String {
    match copy_from {
        Some(copy_from) => format!(", {}@{}", copy_from.url, copy_from.rev),
        None => String::new(),
    }
}

impl CommitEditor for RecEditor {
    type Dir = String;
    type File = String;
    type TextDelta = RecTextDelta;

    fn open_root(&mut self, base_rev: u32) -> Result<String, TransportError> {
        self.record(format!("open_root(r{base_rev})"))?;
        Ok(String::new())
    }

    fn delete_entry(
        &mut self,
        path: &str,
        rev: u32,
        _parent: &mut String,
    ) -> Result<(), TransportError> {
        self.record(format!("delete_entry({path}, r{rev})"))
    }

    fn add_directory(
        &mut self,
        path: &str,
        _parent: &mut String,
        copy_from: Option<CopySource>,
    ) -> Result<String, TransportError> {
        self.record(format!(
            "add_directory({path}{})",
            copy_str(copy_from.as_ref()),
        ))?;
        Ok(path.to_string())
    }

    fn open_directory(
        &mut self,
        path: &str,
        _parent: &mut String,
        base_rev: u32,
    ) -> Result<String, TransportError> {
        self.record(format!("open_directory({path}, r{base_rev})"))?;
        Ok(path.to_string())
    }

    fn change_dir_prop(
        &mut self,
        dir: &mut String,
        name: &str,
        value: Option<&[u8]>,
    ) -> Result<(), TransportError> {
        self.record(format!("change_dir_prop({dir}, {name}, {})", value_str(value)))
    }

    fn close_directory(&mut self, dir: String) -> Result<(), TransportError> {
        self.record(format!("close_directory({dir})"))
    }

    fn add_file(
        &mut self,
        path: &str,
        _parent: &mut String,
        copy_from: Option<CopySource>,
    ) -> Result<String, TransportError> {
        self.record(format!("add_file({path}{})", copy_str(copy_from.as_ref())))?;
        Ok(path.to_string())
    }

    fn open_file(
        &mut self,
        path: &str,
        _parent: &mut String,
        base_rev: u32,
    ) -> Result<String, TransportError> {
        self.record(format!("open_file({path}, r{base_rev})"))?;
        Ok(path.to_string())
    }

    fn change_file_prop(
        &mut self,
        file: &mut String,
        name: &str,
        value: Option<&[u8]>,
    ) -> Result<(), TransportError> {
        self.record(format!(
            "change_file_prop({file}, {name}, {})",
            value_str(value),
        ))
    }

    fn apply_textdelta(
        &mut self,
        file: &mut String,
        _base_checksum: Option<&str>,
    ) -> Result<RecTextDelta, TransportError> {
        self.record(format!("apply_textdelta({file})"))?;
        Ok(RecTextDelta {
            state: self.state.clone(),
            path: file.clone(),
            data: Vec::new(),
        })
    }

    fn close_file(&mut self, file: String) -> Result<(), TransportError> {
        self.record(format!("close_file({file})"))
    }

    fn close_edit(self) -> Result<CommitInfo, TransportError> {
        let mut state = self.state.borrow_mut();
        let revision = state.head + 1;
        state.record(format!("close_edit() -> r{revision}"))?;
        state.head = revision;
        let mut revprops = self.revprops;
        revprops.insert("svn:date".into(), b"2020-02-02T00:00:00.000000Z".to_vec());
        revprops.insert("svn:author".into(), b"committer".to_vec());
        state.revprops.insert(revision, revprops);
        Ok(CommitInfo { revision })
    }

    fn abort_edit(self) -> Result<(), TransportError> {
        self.record("abort_edit()".into())
    }
}

/// Collects the target of windows applied against an empty source.
pub(crate) struct RecTextDelta {
    state: Rc<RefCell<State>>,
    path: String,
    data: Vec<u8>,
}

impl WindowHandler for RecTextDelta {
    fn handle_window(&mut self, window: Option<&DeltaWindow>) -> Result<(), TransportError> {
        match window {
            Some(window) => window.apply(&[], &mut self.data)?,
            None => self.state.borrow_mut().record(format!(
                "textdelta_end({}, {})",
                self.path,
                self.data.escape_ascii(),
            ))?,
        }
        Ok(())
    }
}
