use smallvec::SmallVec;

use super::LoadError;
use crate::ra::CommitEditor;

// Relpaths are canonical repository paths relative to the root: no leading
// or trailing `/`, no empty, `.` or `..` components. The root is `""`.

pub(crate) fn dirname(path: &str) -> &str {
    match path.rfind('/') {
        Some(i) => &path[..i],
        None => "",
    }
}

pub(crate) fn basename(path: &str) -> &str {
    match path.rfind('/') {
        Some(i) => &path[(i + 1)..],
        None => path,
    }
}

pub(crate) fn join(base: &str, component: &str) -> String {
    if base.is_empty() {
        component.to_string()
    } else if component.is_empty() {
        base.to_string()
    } else {
        format!("{base}/{component}")
    }
}

pub(crate) fn components(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|c| !c.is_empty())
}

/// Deepest common ancestor of `a` and `b`, compared component-wise.
pub(crate) fn longest_ancestor<'p>(a: &'p str, b: &str) -> &'p str {
    let mut len = 0;
    for (ca, cb) in components(a).zip(components(b)) {
        if ca != cb {
            break;
        }
        len = if len == 0 { ca.len() } else { len + 1 + ca.len() };
    }
    &a[..len]
}

/// Returns `path` relative to `ancestor`, or `None` when it is not a
/// descendant (or `ancestor` itself).
pub(crate) fn skip_ancestor<'p>(ancestor: &str, path: &'p str) -> Option<&'p str> {
    if ancestor.is_empty() {
        return Some(path);
    }
    let rest = path.strip_prefix(ancestor)?;
    if rest.is_empty() {
        Some(rest)
    } else {
        rest.strip_prefix('/')
    }
}

/// Turns a node path from a dump into a relpath. A leading `/` is
/// accepted; empty, `.` and `..` components are not.
pub(crate) fn canonicalize(path: &str) -> Option<String> {
    let path = path.strip_prefix('/').unwrap_or(path);
    let path = path.strip_suffix('/').unwrap_or(path);
    if path.is_empty() {
        return None;
    }
    if path
        .split('/')
        .any(|c| c.is_empty() || c == "." || c == "..")
    {
        return None;
    }
    Some(path.to_string())
}

/// Moves from the open directory `from` to `to`: how many directories have
/// to be closed, and which components have to be opened afterwards, root
/// to leaf.
pub(crate) fn plan<'t>(from: &str, to: &'t str) -> (usize, SmallVec<[&'t str; 8]>) {
    let ancestor = longest_ancestor(to, from);
    let n_close = skip_ancestor(ancestor, from).map_or(0, |rest| components(rest).count());
    let to_open = skip_ancestor(ancestor, to)
        .map(|rest| components(rest).collect())
        .unwrap_or_default();
    (n_close, to_open)
}

pub(crate) struct DirFrame<D> {
    pub(crate) handle: D,
    pub(crate) relpath: String,
    pub(crate) depth: usize,
}

/// Open directories of an edit. The bottom frame is the root, and each
/// frame is a child of the one below it.
pub(crate) struct DirStack<D> {
    root: DirFrame<D>,
    frames: Vec<DirFrame<D>>,
}

impl<D> DirStack<D> {
    pub(crate) fn new(root: D) -> Self {
        Self {
            root: DirFrame {
                handle: root,
                relpath: String::new(),
                depth: 0,
            },
            frames: Vec::new(),
        }
    }

    #[inline]
    pub(crate) fn top(&self) -> &DirFrame<D> {
        self.frames.last().unwrap_or(&self.root)
    }

    #[inline]
    pub(crate) fn top_mut(&mut self) -> &mut DirFrame<D> {
        self.frames.last_mut().unwrap_or(&mut self.root)
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.frames.len() + 1
    }

    /// Pushes a directory just opened or added inside the current top.
    pub(crate) fn push(&mut self, handle: D, relpath: String) {
        let depth = self.top().depth + 1;
        debug_assert_eq!(dirname(&relpath), self.top().relpath);
        self.frames.push(DirFrame {
            handle,
            relpath,
            depth,
        });
    }

    /// Closes and opens directories until `target` is on top.
    pub(crate) fn reconcile<E>(
        &mut self,
        editor: &mut E,
        target: &str,
        base_rev: u32,
    ) -> Result<(), LoadError>
    where
        E: CommitEditor<Dir = D>,
    {
        if self.top().relpath == target {
            return Ok(());
        }

        let (n_close, to_open) = plan(&self.top().relpath, target);
        if n_close > self.frames.len() {
            return Err(LoadError::MalformedDumpOrder(format!(
                "reaching {target:?} from {:?} would close the root directory",
                self.top().relpath,
            )));
        }

        let closing = self.frames.split_off(self.frames.len() - n_close);
        for frame in closing.into_iter().rev() {
            tracing::trace!("close_directory({:?})", frame.relpath);
            editor.close_directory(frame.handle)?;
        }

        for component in to_open {
            let parent = self.top_mut();
            let relpath = join(&parent.relpath, component);
            tracing::trace!("open_directory({relpath:?}, r{base_rev})");
            let handle = editor.open_directory(&relpath, &mut parent.handle, base_rev)?;
            self.push(handle, relpath);
        }

        Ok(())
    }

    /// Closes every open directory, root last.
    pub(crate) fn close_all<E>(mut self, editor: &mut E) -> Result<(), LoadError>
    where
        E: CommitEditor<Dir = D>,
    {
        while let Some(frame) = self.frames.pop() {
            tracing::trace!("close_directory({:?})", frame.relpath);
            editor.close_directory(frame.handle)?;
        }
        tracing::trace!("close_directory(\"\")");
        editor.close_directory(self.root.handle)?;
        Ok(())
    }
}
