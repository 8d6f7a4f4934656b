use std::collections::BTreeMap;

pub(crate) type PropMap = BTreeMap<String, Vec<u8>>;

pub(crate) const PROP_REVISION_AUTHOR: &str = "svn:author";
pub(crate) const PROP_REVISION_DATE: &str = "svn:date";

const SVN_PROP_PREFIX: &str = "svn:";
const WC_PROP_PREFIX: &str = "svn:wc:";
const ENTRY_PROP_PREFIX: &str = "svn:entry:";

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum PropKind {
    /// Bookkeeping of working copies, never stored in a repository.
    Wc,
    /// Entry metadata (last committed revision, author...), derived by the
    /// repository itself.
    Entry,
    Regular,
}

impl PropKind {
    pub(crate) fn of(name: &str) -> Self {
        if name.starts_with(WC_PROP_PREFIX) {
            Self::Wc
        } else if name.starts_with(ENTRY_PROP_PREFIX) {
            Self::Entry
        } else {
            Self::Regular
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum PropError {
    InvalidName,
    NonRegular(PropKind),
    NotUtf8,
    NonLfLineEnding,
}

impl std::fmt::Display for PropError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            Self::InvalidName => write!(f, "invalid property name"),
            Self::NonRegular(kind) => {
                write!(f, "storage of non-regular property ({kind:?}) is not allowed")
            }
            Self::NotUtf8 => write!(f, "value is not encoded in UTF-8"),
            Self::NonLfLineEnding => write!(f, "value has non-LF line endings"),
        }
    }
}

/// Property names start with a letter, `_` or `:`, followed by letters,
/// digits, `-`, `.`, `_` or `:`.
pub(crate) fn is_valid_name(name: &str) -> bool {
    let mut chars = name.bytes();
    let Some(first) = chars.next() else {
        return false;
    };
    if !(first.is_ascii_alphabetic() || first == b'_' || first == b':') {
        return false;
    }
    chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, b'-' | b'.' | b'_' | b':'))
}

/// Checks a property before it is handed to the repository. A `None` value
/// stands for a deletion, which only needs a valid regular name.
pub(crate) fn validate(name: &str, value: Option<&[u8]>) -> Result<(), PropError> {
    if !is_valid_name(name) {
        return Err(PropError::InvalidName);
    }

    let kind = PropKind::of(name);
    if kind != PropKind::Regular {
        return Err(PropError::NonRegular(kind));
    }

    if let Some(value) = value {
        // "svn:" properties are human readable text and go through
        // line-ending and encoding translation on checkout.
        if name.starts_with(SVN_PROP_PREFIX) {
            if std::str::from_utf8(value).is_err() {
                return Err(PropError::NotUtf8);
            }
            if value.contains(&b'\r') {
                return Err(PropError::NonLfLineEnding);
            }
        }
    }

    Ok(())
}
