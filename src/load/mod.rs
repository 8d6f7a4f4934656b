use std::io::Read;

use crate::FHashMap;
use crate::ra::{CommitEditor, Notify, Session, TransportError};
use crate::svn::delta::WindowReader;
use crate::svn::dump::{self, DumpReader, ReadError};
use crate::svn::parse::{self, DumpHandler};
use crate::svn::props::PropError;

pub(crate) mod lock;
mod node;
pub(crate) mod reconcile;
#[cfg(test)]
mod recorder;
mod revision;

pub(crate) use lock::LockOptions;
use node::{CopyFrom, NodeRecord, NodeState};
use revision::RevisionSession;

#[derive(Debug)]
pub(crate) enum LoadError {
    LockUnavailable {
        attempts: u32,
    },
    MalformedDumpOrder(String),
    InvalidProperty {
        name: String,
        reason: PropError,
    },
    Transport(TransportError),
    Cancelled,
    InvalidNodePath(String),
    Dump(ReadError),
    /// The lock could not be released after `error` ended the load.
    WithReleaseFailure {
        error: Box<LoadError>,
        release: Box<LoadError>,
    },
}

impl From<TransportError> for LoadError {
    #[inline]
    fn from(e: TransportError) -> Self {
        Self::Transport(e)
    }
}

impl From<ReadError> for LoadError {
    #[inline]
    fn from(e: ReadError) -> Self {
        Self::Dump(e)
    }
}

impl From<std::io::Error> for LoadError {
    #[inline]
    fn from(e: std::io::Error) -> Self {
        Self::Dump(ReadError::Io(e))
    }
}

impl From<parse::Cancelled> for LoadError {
    #[inline]
    fn from(_: parse::Cancelled) -> Self {
        Self::Cancelled
    }
}

impl std::fmt::Display for LoadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LockUnavailable { attempts } => write!(
                f,
                "failed to get lock on destination repository after {attempts} attempts",
            ),
            Self::MalformedDumpOrder(msg) => write!(f, "malformed dump: {msg}"),
            Self::InvalidProperty { name, reason } => {
                write!(f, "invalid property {name:?}: {reason}")
            }
            Self::Transport(e) => write!(f, "destination error: {e}"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::InvalidNodePath(path) => write!(f, "invalid node path: {path:?}"),
            Self::Dump(e) => write!(f, "failed to read dump: {e}"),
            Self::WithReleaseFailure { error, release } => {
                write!(f, "{error} (additionally, failed to release lock: {release})")
            }
        }
    }
}

#[derive(Clone, Debug)]
pub(crate) struct LoadOptions {
    pub(crate) lock: LockOptions,
    /// Revision properties that are dropped while loading.
    pub(crate) skip_revprops: Vec<String>,
    pub(crate) validate_props: bool,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            lock: LockOptions::default(),
            skip_revprops: Vec::new(),
            validate_props: true,
        }
    }
}

/// Replays the dump in `reader` into `session`, one revision per commit,
/// while holding the destination lock.
pub(crate) fn load_dumpstream<S: Session>(
    reader: &mut DumpReader<'_>,
    session: &mut S,
    options: &LoadOptions,
    notify: &mut dyn Notify,
    cancel: &dyn Fn() -> bool,
) -> Result<(), LoadError> {
    let lock = lock::acquire(session, &options.lock, cancel, &mut |holder| {
        tracing::warn!(
            "failed to get lock on destination repository, currently held by {:?}",
            String::from_utf8_lossy(holder),
        );
    })?;

    let result = {
        let mut loader = Loader::new(session, options, notify);
        let result = parse::parse_dumpstream(reader, &mut loader, cancel);
        if result.is_err() {
            loader.abort();
        }
        result
    };

    let release = lock::release(session, &lock);
    match (result, release) {
        (Ok(()), release) => release,
        (Err(error), Ok(())) => Err(error),
        (Err(error), Err(release)) => Err(LoadError::WithReleaseFailure {
            error: Box::new(error),
            release: Box::new(release),
        }),
    }
}

type FileOf<S> = <<S as Session>::Editor as CommitEditor>::File;

struct Loader<'a, S: Session> {
    session: &'a mut S,
    root_url: String,
    options: &'a LoadOptions,
    notify: &'a mut dyn Notify,
    uuid: Option<uuid::Uuid>,
    /// Dump revision to committed revision.
    rev_map: FHashMap<u32, u32>,
    /// Difference between dump and destination numbering, known at the
    /// first revision after 0.
    rev_offset: Option<i64>,
    revision: Option<RevisionSession<S>>,
    node: Option<NodeState<FileOf<S>>>,
}

impl<'a, S: Session> Loader<'a, S> {
    fn new(session: &'a mut S, options: &'a LoadOptions, notify: &'a mut dyn Notify) -> Self {
        let root_url = session.repos_root().trim_end_matches('/').to_string();
        Self {
            session,
            root_url,
            options,
            notify,
            uuid: None,
            rev_map: FHashMap::default(),
            rev_offset: None,
            revision: None,
            node: None,
        }
    }

    fn abort(&mut self) {
        self.node = None;
        if let Some(mut revision) = self.revision.take() {
            revision.abort();
        }
    }

    fn map_new_rev(&mut self, rev: u32) -> Result<u32, LoadError> {
        if rev == 0 {
            return Ok(0);
        }
        let offset = match self.rev_offset {
            Some(offset) => offset,
            None => {
                let head = self.session.head_revision()?;
                let offset = i64::from(rev) - (i64::from(head) + 1);
                if offset != 0 {
                    tracing::info!(
                        "destination is at r{head}, dump revision r{rev} will be loaded as r{}",
                        head + 1,
                    );
                }
                self.rev_offset = Some(offset);
                offset
            }
        };
        u32::try_from(i64::from(rev) - offset)
            .ok()
            .filter(|&mapped| mapped != 0)
            .ok_or_else(|| {
                LoadError::MalformedDumpOrder(format!(
                    "revision r{rev} precedes the first loaded revision",
                ))
            })
    }

    /// Translates a copy-from revision of the dump.
    fn map_copy_rev(&self, rev: u32) -> Result<u32, LoadError> {
        if let Some(&mapped) = self.rev_map.get(&rev) {
            return Ok(mapped);
        }
        let offset = self.rev_offset.unwrap_or(0);
        u32::try_from(i64::from(rev) - offset).map_err(|_| {
            LoadError::MalformedDumpOrder(format!(
                "copy source revision r{rev} is older than the destination",
            ))
        })
    }

    fn revision_mut(&mut self) -> Result<&mut RevisionSession<S>, LoadError> {
        self.revision.as_mut().ok_or_else(no_revision)
    }

    fn node_parts(
        &mut self,
    ) -> Result<
        (
            &mut S,
            &mut RevisionSession<S>,
            &mut NodeState<FileOf<S>>,
        ),
        LoadError,
    > {
        let node = self
            .node
            .as_mut()
            .ok_or_else(|| LoadError::MalformedDumpOrder("node event outside of a node".into()))?;
        let revision = self.revision.as_mut().ok_or_else(no_revision)?;
        Ok((&mut *self.session, revision, node))
    }

    fn change_node_prop(&mut self, name: &str, value: Option<&[u8]>) -> Result<(), LoadError> {
        let check_props = self.options.validate_props;
        let (_, revision, node) = self.node_parts()?;
        let Some((editor, stack)) = revision.active() else {
            return Err(LoadError::MalformedDumpOrder(
                "node property without transaction".into(),
            ));
        };
        node::change_prop(editor, stack, node, name, value, check_props)
    }
}

fn no_revision() -> LoadError {
    LoadError::MalformedDumpOrder("record outside of a revision".into())
}

fn no_transaction() -> LoadError {
    LoadError::MalformedDumpOrder("node without transaction".into())
}

impl<S: Session> DumpHandler for Loader<'_, S> {
    type Error = LoadError;

    fn uuid_record(&mut self, uuid: &uuid::Uuid) -> Result<(), LoadError> {
        if let Some(ref previous) = self.uuid {
            tracing::warn!("more than one UUID record in dump, {previous} replaced");
        }
        tracing::info!("dump repository UUID: {uuid}");
        self.uuid = Some(*uuid);
        Ok(())
    }

    fn new_revision_record(&mut self, rev: u32) -> Result<(), LoadError> {
        tracing::debug!("loading dump revision r{rev}");
        let mapped_rev = self.map_new_rev(rev)?;
        self.revision = Some(RevisionSession::new(
            rev,
            mapped_rev,
            self.options.validate_props,
        ));
        Ok(())
    }

    fn set_revision_property(&mut self, name: &str, value: &[u8]) -> Result<(), LoadError> {
        if self.options.skip_revprops.iter().any(|skip| skip == name) {
            tracing::debug!("skipping revision property {name:?}");
            return Ok(());
        }
        let session = &mut *self.session;
        let revision = self.revision.as_mut().ok_or_else(no_revision)?;
        revision.set_revision_property(session, name, value)
    }

    fn new_node_record(&mut self, node: &dump::NodeRecord) -> Result<(), LoadError> {
        let path = reconcile::canonicalize(&node.path)
            .ok_or_else(|| LoadError::InvalidNodePath(node.path.clone()))?;
        let copy_from = node
            .copy_from
            .as_ref()
            .map(|copy_from| {
                let path = reconcile::canonicalize(&copy_from.path)
                    .ok_or_else(|| LoadError::InvalidNodePath(copy_from.path.clone()))?;
                let rev = self.map_copy_rev(copy_from.rev)?;
                Ok::<_, LoadError>(CopyFrom { path, rev })
            })
            .transpose()?;

        let record = NodeRecord {
            path,
            kind: node.kind.into(),
            action: node.action,
            copy_from,
            base_checksum: node.text_delta_base_md5.clone(),
        };
        tracing::trace!(
            "node {:?}: {:?} {:?}",
            record.path,
            record.action,
            record.kind,
        );

        let root_url = self.root_url.as_str();
        let session = &mut *self.session;
        let revision = self.revision.as_mut().ok_or_else(no_revision)?;
        let base_rev = revision.base_rev();
        let (editor, stack) = revision.begin_node(session)?;
        let state = node::open_node(editor, stack, record, root_url, base_rev)?;
        self.node = Some(state);
        Ok(())
    }

    fn set_node_property(&mut self, name: &str, value: &[u8]) -> Result<(), LoadError> {
        self.change_node_prop(name, Some(value))
    }

    fn delete_node_property(&mut self, name: &str) -> Result<(), LoadError> {
        self.change_node_prop(name, None)
    }

    fn remove_node_props(&mut self) -> Result<(), LoadError> {
        let check_props = self.options.validate_props;
        let (session, revision, node) = self.node_parts()?;
        let base_rev = revision.base_rev();
        let (editor, stack) = revision.active().ok_or_else(no_transaction)?;
        node::remove_node_props(&*session, editor, stack, node, base_rev, check_props)
    }

    fn set_fulltext(&mut self, text: &mut dyn Read) -> Result<(), LoadError> {
        let (_, revision, node) = self.node_parts()?;
        let (editor, _) = revision.active().ok_or_else(no_transaction)?;
        node::set_fulltext(editor, node, text)
    }

    fn apply_textdelta(
        &mut self,
        windows: &mut WindowReader<&mut dyn Read>,
    ) -> Result<(), LoadError> {
        let (_, revision, node) = self.node_parts()?;
        let (editor, _) = revision.active().ok_or_else(no_transaction)?;
        node::apply_textdelta(editor, node, windows)
    }

    fn close_node(&mut self) -> Result<(), LoadError> {
        let Some(node) = self.node.take() else {
            return Ok(());
        };
        let revision = self.revision_mut()?;
        match revision.active() {
            Some((editor, _)) => node::close_node(editor, node),
            // Nodes that failed to produce a transaction have nothing open.
            None => Ok(()),
        }
    }

    fn close_revision(&mut self) -> Result<(), LoadError> {
        let Some(mut revision) = self.revision.take() else {
            return Ok(());
        };
        let committed = revision.close(self.session, self.notify)?;
        if revision.rev() != 0 {
            self.rev_map.insert(revision.rev(), committed);
        }
        tracing::debug!("dump revision r{} loaded as r{committed}", revision.rev());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::lock::LOCK_PROP;
    use super::recorder::RecSession;
    use super::{LoadError, LoadOptions, LockOptions, load_dumpstream};
    use crate::svn::dump::DumpReader;

    fn options() -> LoadOptions {
        LoadOptions {
            lock: LockOptions {
                retries: 3,
                retry_delay: std::time::Duration::ZERO,
            },
            ..LoadOptions::default()
        }
    }

    fn load(
        session: &mut RecSession,
        options: &LoadOptions,
        dump: &[u8],
        cancel: &dyn Fn() -> bool,
    ) -> (Result<(), LoadError>, Vec<u32>) {
        let mut src = dump;
        let mut reader = DumpReader::new(&mut src).unwrap();
        let mut loaded = Vec::new();
        let r = load_dumpstream(
            &mut reader,
            session,
            options,
            &mut |rev| loaded.push(rev),
            cancel,
        );
        (r, loaded)
    }

    /// Editor calls only, without lock and revision property traffic.
    fn edit_calls(log: Vec<String>) -> Vec<String> {
        log.into_iter()
            .filter(|entry| !entry.starts_with("change_rev_prop("))
            .collect()
    }

    const ADD_TRUNK: &[u8] = b"SVN-fs-dump-format-version: 2\n\n\
        Revision-number: 1\n\
        Prop-content-length: 10\n\
        Content-length: 10\n\n\
        PROPS-END\n\n\
        Node-path: trunk\n\
        Node-kind: dir\n\
        Node-action: add\n\n\
        Node-path: trunk/a.txt\n\
        Node-kind: file\n\
        Node-action: add\n\
        Text-content-length: 2\n\
        Content-length: 2\n\n\
        hi\n\n";

    #[test]
    fn test_add_dir_and_file() {
        let mut session = RecSession::new();
        let (r, loaded) = load(&mut session, &options(), ADD_TRUNK, &|| false);
        r.unwrap();
        assert_eq!(loaded, [1]);
        assert_eq!(
            edit_calls(session.take_log()),
            [
                "commit_editor()",
                "open_root(r0)",
                "add_directory(trunk)",
                "add_file(trunk/a.txt)",
                "apply_textdelta(trunk/a.txt)",
                "textdelta_end(trunk/a.txt, hi)",
                "close_file(trunk/a.txt)",
                "close_directory(trunk)",
                "close_directory()",
                "close_edit() -> r1",
            ],
        );
        // The lock is gone.
        assert!(!session.revprops(0).contains_key(LOCK_PROP));
    }

    #[test]
    fn test_delete_inside_open_dir() {
        let dump = b"SVN-fs-dump-format-version: 2\n\n\
            Revision-number: 2\n\n\
            Node-path: trunk/b.txt\n\
            Node-kind: file\n\
            Node-action: change\n\n\
            Node-path: trunk/a.txt\n\
            Node-action: delete\n\n";

        let mut session = RecSession::new();
        session.set_head(1);
        let (r, loaded) = load(&mut session, &options(), dump, &|| false);
        r.unwrap();
        assert_eq!(loaded, [2]);
        assert_eq!(
            edit_calls(session.take_log()),
            [
                "commit_editor()",
                "open_root(r1)",
                "open_directory(trunk, r1)",
                "open_file(trunk/b.txt, r1)",
                "close_file(trunk/b.txt)",
                "delete_entry(trunk/a.txt, r1)",
                "close_directory(trunk)",
                "close_directory()",
                "close_edit() -> r2",
            ],
        );
    }

    #[test]
    fn test_sibling_subtrees() {
        let dump = b"SVN-fs-dump-format-version: 2\n\n\
            Revision-number: 1\n\n\
            Node-path: a/x/f\n\
            Node-kind: file\n\
            Node-action: change\n\n\
            Node-path: b/g\n\
            Node-kind: file\n\
            Node-action: change\n\n";

        let mut session = RecSession::new();
        let (r, _) = load(&mut session, &options(), dump, &|| false);
        r.unwrap();
        assert_eq!(
            edit_calls(session.take_log())[2..8],
            [
                "open_directory(a, r0)",
                "open_directory(a/x, r0)",
                "open_file(a/x/f, r0)",
                "close_file(a/x/f)",
                "close_directory(a/x)",
                "close_directory(a)",
            ],
        );
    }

    #[test]
    fn test_revision_0_and_empty_revision() {
        let dump = b"SVN-fs-dump-format-version: 2\n\n\
            Revision-number: 0\n\
            Prop-content-length: 56\n\
            Content-length: 56\n\n\
            K 8\nsvn:date\nV 27\n2005-05-05T05:05:05.000000Z\nPROPS-END\n\n\
            Revision-number: 1\n\
            Prop-content-length: 34\n\
            Content-length: 34\n\n\
            K 10\nsvn:author\nV 3\nbob\nPROPS-END\n\n";

        let mut session = RecSession::new();
        let (r, loaded) = load(&mut session, &options(), dump, &|| false);
        r.unwrap();
        assert_eq!(loaded, [0, 1]);

        let log = session.take_log();
        let date_change = "change_rev_prop(r0, svn:date, 2005-05-05T05:05:05.000000Z)";
        assert!(log.iter().any(|entry| entry == date_change));
        assert_eq!(
            edit_calls(log),
            [
                "commit_editor()",
                "open_root(r0)",
                "close_directory()",
                "close_edit() -> r1",
            ],
        );
        let revprops = session.revprops(1);
        assert!(!revprops.contains_key("svn:date"));
        assert_eq!(revprops["svn:author"], b"bob");
    }

    #[test]
    fn test_revision_offset() {
        let dump = b"SVN-fs-dump-format-version: 2\n\n\
            Revision-number: 7\n\n\
            Node-path: a\n\
            Node-kind: dir\n\
            Node-action: add\n\n\
            Revision-number: 8\n\n\
            Node-path: b\n\
            Node-kind: dir\n\
            Node-action: add\n\
            Node-copyfrom-rev: 7\n\
            Node-copyfrom-path: a\n\n";

        let mut session = RecSession::new();
        session.set_head(3);
        let (r, loaded) = load(&mut session, &options(), dump, &|| false);
        r.unwrap();
        assert_eq!(loaded, [4, 5]);
        let calls = edit_calls(session.take_log());
        assert!(calls.contains(&"open_root(r3)".into()));
        assert!(calls.contains(&"open_root(r4)".into()));
        assert!(calls.contains(&"add_directory(b, mem:///rec/a@4)".into()));
    }

    #[test]
    fn test_lock_without_atomic_revprops() {
        let mut session = RecSession::new();
        session.set_atomic(false);
        let (r, loaded) = load(&mut session, &options(), ADD_TRUNK, &|| false);
        r.unwrap();
        assert_eq!(loaded, [1]);
        assert!(!session.revprops(0).contains_key(LOCK_PROP));
    }

    #[test]
    fn test_lock_unavailable() {
        let mut session = RecSession::new();
        session.set_rev_prop(0, LOCK_PROP, b"1:someone-else");
        let (r, loaded) = load(&mut session, &options(), ADD_TRUNK, &|| false);
        assert!(matches!(r, Err(LoadError::LockUnavailable { attempts: 3 })));
        assert!(loaded.is_empty());
        assert!(edit_calls(session.take_log()).is_empty());
    }

    #[test]
    fn test_cancel_releases_lock() {
        let mut session = RecSession::new();
        // The lock takes two cancellation checks, then the first record
        // is read.
        let checks = AtomicUsize::new(0);
        let cancel = || checks.fetch_add(1, Ordering::Relaxed) >= 3;
        let (r, _) = load(&mut session, &options(), ADD_TRUNK, &cancel);
        assert!(matches!(r, Err(LoadError::Cancelled)));
        assert!(!session.revprops(0).contains_key(LOCK_PROP));
    }

    #[test]
    fn test_failure_releases_lock() {
        let mut session = RecSession::new();
        session.fail_on("add_file(");
        let (r, loaded) = load(&mut session, &options(), ADD_TRUNK, &|| false);
        assert!(matches!(r, Err(LoadError::Transport(_))));
        assert!(loaded.is_empty());
        let log = session.take_log();
        assert!(log.contains(&"abort_edit()".into()));
        assert!(!session.revprops(0).contains_key(LOCK_PROP));
    }

    #[test]
    fn test_release_failure_is_composed() {
        let mut session = RecSession::new();
        session.fail_on("change_rev_prop(r0, svn:rdump-lock, <delete>)");
        let dump = b"SVN-fs-dump-format-version: 2\n\n\
            Node-path: a\n\
            Node-action: delete\n\n";
        let (r, _) = load(&mut session, &options(), dump, &|| false);
        let Err(LoadError::WithReleaseFailure { error, release }) = r else {
            panic!("expected composed error");
        };
        assert!(matches!(*error, LoadError::Dump(_)));
        assert!(matches!(*release, LoadError::Transport(_)));
    }

    #[test]
    fn test_invalid_node_path() {
        let dump = b"SVN-fs-dump-format-version: 2\n\n\
            Revision-number: 1\n\n\
            Node-path: a/../b\n\
            Node-kind: dir\n\
            Node-action: add\n\n";
        let mut session = RecSession::new();
        let (r, _) = load(&mut session, &options(), dump, &|| false);
        assert!(matches!(r, Err(LoadError::InvalidNodePath(_))));
    }

    #[test]
    fn test_skipped_revision_property() {
        let dump = b"SVN-fs-dump-format-version: 2\n\n\
            Revision-number: 1\n\
            Prop-content-length: 30\n\
            Content-length: 30\n\n\
            K 9\nsvn:sync-\nV 1\nx\nPROPS-END\n\n";
        let mut session = RecSession::new();
        let mut options = options();
        options.skip_revprops.push("svn:sync-".into());
        let (r, _) = load(&mut session, &options, dump, &|| false);
        r.unwrap();
        assert!(session.take_log().contains(&"commit_editor()".into()));
    }
}
