use super::LoadError;
use super::reconcile::DirStack;
use crate::ra::{CommitEditor, Notify, Session};
use crate::svn::props::{self, PROP_REVISION_AUTHOR, PROP_REVISION_DATE, PropMap};

type EditorOf<S> = <S as Session>::Editor;
type DirOf<S> = <EditorOf<S> as CommitEditor>::Dir;

pub(crate) enum SessionState<S: Session> {
    /// Revision properties are being collected, no transaction yet.
    Pending,
    Active {
        editor: EditorOf<S>,
        stack: DirStack<DirOf<S>>,
    },
    Closed,
}

/// Loading state of a single dump revision.
pub(crate) struct RevisionSession<S: Session> {
    rev: u32,
    /// Revision number the destination is expected to assign.
    mapped_rev: u32,
    check_props: bool,
    revprops: PropMap,
    datestamp: Option<Vec<u8>>,
    author: Option<Vec<u8>>,
    state: SessionState<S>,
}

impl<S: Session> RevisionSession<S> {
    pub(crate) fn new(rev: u32, mapped_rev: u32, check_props: bool) -> Self {
        Self {
            rev,
            mapped_rev,
            check_props,
            revprops: PropMap::new(),
            datestamp: None,
            author: None,
            state: SessionState::Pending,
        }
    }

    #[inline]
    pub(crate) fn rev(&self) -> u32 {
        self.rev
    }

    #[inline]
    pub(crate) fn mapped_rev(&self) -> u32 {
        self.mapped_rev
    }

    /// Revision the edit is based on.
    #[inline]
    pub(crate) fn base_rev(&self) -> u32 {
        self.mapped_rev.saturating_sub(1)
    }

    #[cfg(test)]
    pub(crate) fn revprops(&self) -> &PropMap {
        &self.revprops
    }

    pub(crate) fn set_revision_property(
        &mut self,
        session: &mut S,
        name: &str,
        value: &[u8],
    ) -> Result<(), LoadError> {
        self.check_prop(name, Some(value))?;

        if self.rev == 0 {
            // There is no transaction for revision 0, so its properties
            // go straight to the destination.
            session.change_rev_prop(0, name, None, Some(value))?;
        } else {
            self.revprops.insert(name.to_string(), value.to_vec());
        }

        if name == PROP_REVISION_DATE {
            self.datestamp = Some(value.to_vec());
        } else if name == PROP_REVISION_AUTHOR {
            self.author = Some(value.to_vec());
        }

        Ok(())
    }

    fn check_prop(&self, name: &str, value: Option<&[u8]>) -> Result<(), LoadError> {
        if self.check_props {
            props::validate(name, value).map_err(|reason| LoadError::InvalidProperty {
                name: name.to_string(),
                reason,
            })?;
        }
        Ok(())
    }

    /// Properties the commit editor is created with. Author and date are
    /// assigned by the destination on commit, and restored afterwards.
    fn txn_revprops(&mut self) -> PropMap {
        let mut revprops = std::mem::take(&mut self.revprops);
        revprops.remove(PROP_REVISION_AUTHOR);
        revprops.remove(PROP_REVISION_DATE);
        revprops
    }

    /// Makes sure the transaction is open, opening it with its root
    /// directory on the first node.
    pub(crate) fn begin_node(
        &mut self,
        session: &mut S,
    ) -> Result<(&mut EditorOf<S>, &mut DirStack<DirOf<S>>), LoadError> {
        if matches!(self.state, SessionState::Pending) {
            if self.rev == 0 {
                return Err(LoadError::MalformedDumpOrder(
                    "node record in revision 0".into(),
                ));
            }

            let revprops = self.txn_revprops();
            let mut editor = session.commit_editor(revprops)?;
            tracing::trace!("open_root(r{})", self.base_rev());
            let root = editor.open_root(self.base_rev())?;
            self.state = SessionState::Active {
                editor,
                stack: DirStack::new(root),
            };
        }

        let rev = self.rev;
        match self.active() {
            Some(active) => Ok(active),
            None => panic!("revision r{rev} used after close"),
        }
    }

    pub(crate) fn active(&mut self) -> Option<(&mut EditorOf<S>, &mut DirStack<DirOf<S>>)> {
        match self.state {
            SessionState::Active {
                ref mut editor,
                ref mut stack,
            } => Some((editor, stack)),
            _ => None,
        }
    }

    /// Commits the revision and returns the number the destination gave
    /// it.
    pub(crate) fn close(
        &mut self,
        session: &mut S,
        notify: &mut dyn Notify,
    ) -> Result<u32, LoadError> {
        let state = std::mem::replace(&mut self.state, SessionState::Closed);

        if self.rev == 0 {
            match state {
                SessionState::Pending => {}
                SessionState::Active { .. } => unreachable!("revision 0 has no transaction"),
                SessionState::Closed => panic!("revision r0 closed twice"),
            }
            notify.revision_loaded(0);
            return Ok(0);
        }

        let commit_info = match state {
            SessionState::Pending => {
                // Revision without nodes, commit an empty edit.
                let revprops = self.txn_revprops();
                let mut editor = session.commit_editor(revprops)?;
                tracing::trace!("open_root(r{})", self.base_rev());
                let closed = editor.open_root(self.base_rev()).and_then(|root| {
                    tracing::trace!("close_directory(\"\")");
                    editor.close_directory(root)
                });
                if let Err(e) = closed {
                    abort_editor(self.rev, editor);
                    return Err(e.into());
                }
                editor.close_edit()?
            }
            SessionState::Active { mut editor, stack } => {
                if let Err(e) = stack.close_all(&mut editor) {
                    abort_editor(self.rev, editor);
                    return Err(e);
                }
                editor.close_edit()?
            }
            SessionState::Closed => panic!("revision r{} closed twice", self.rev),
        };
        tracing::trace!("close_edit() -> r{}", commit_info.revision);

        let committed = commit_info.revision;
        if committed != self.mapped_rev {
            tracing::warn!(
                "dump revision r{} was committed as r{committed} instead of r{}",
                self.rev,
                self.mapped_rev,
            );
        }

        // Committing overwrites the date and author, put back the ones
        // from the dump.
        self.check_prop(PROP_REVISION_DATE, self.datestamp.as_deref())?;
        session.change_rev_prop(
            committed,
            PROP_REVISION_DATE,
            None,
            self.datestamp.as_deref(),
        )?;
        self.check_prop(PROP_REVISION_AUTHOR, self.author.as_deref())?;
        session.change_rev_prop(committed, PROP_REVISION_AUTHOR, None, self.author.as_deref())?;

        notify.revision_loaded(committed);
        Ok(committed)
    }

    /// Gives up an open transaction after a failure.
    pub(crate) fn abort(&mut self) {
        if let SessionState::Active { editor, .. } =
            std::mem::replace(&mut self.state, SessionState::Closed)
        {
            abort_editor(self.rev, editor);
        }
    }
}

fn abort_editor<E: CommitEditor>(rev: u32, editor: E) {
    tracing::debug!("aborting edit of revision r{rev}");
    if let Err(e) = editor.abort_edit() {
        tracing::warn!("failed to abort edit of revision r{rev}: {e}");
    }
}
