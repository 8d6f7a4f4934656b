use std::time::Duration;

use super::LoadError;
use crate::ra::{Session, TransportError};

/// Revision property on revision 0 that holds the token of the loader
/// currently writing to the destination.
pub(crate) const LOCK_PROP: &str = "svn:rdump-lock";

#[derive(Clone, Debug)]
pub(crate) struct LockOptions {
    pub(crate) retries: u32,
    pub(crate) retry_delay: Duration,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            retries: 10,
            retry_delay: Duration::from_secs(1),
        }
    }
}

#[derive(Debug)]
pub(crate) struct OperationalLock {
    token: String,
    atomic: bool,
}

impl OperationalLock {
    #[cfg(test)]
    pub(crate) fn token(&self) -> &str {
        &self.token
    }
}

/// Takes the lock, waiting while someone else holds it. `on_contention`
/// receives the token of the current holder before each wait.
pub(crate) fn acquire<S: Session>(
    session: &mut S,
    options: &LockOptions,
    cancel: &dyn Fn() -> bool,
    on_contention: &mut dyn FnMut(&[u8]),
) -> Result<OperationalLock, LoadError> {
    let atomic = session.has_atomic_revprops()?;
    if !atomic {
        tracing::warn!(
            "destination does not support atomic revision property edits, \
             locking is subject to races"
        );
    }

    let token = format!("{}:{}", std::process::id(), uuid::Uuid::new_v4());

    for i in 0..options.retries {
        if cancel() {
            return Err(LoadError::Cancelled);
        }
        // The last attempt only checks whether the previous write won.
        let is_last = i + 1 == options.retries;

        match session.rev_prop(0, LOCK_PROP)? {
            Some(holder) if holder == token.as_bytes() => {
                tracing::info!("acquired lock {token:?}");
                return Ok(OperationalLock { token, atomic });
            }
            Some(holder) => {
                if !is_last {
                    on_contention(&holder);
                    std::thread::sleep(options.retry_delay);
                }
            }
            None => {
                if !is_last {
                    let expected_old = atomic.then_some(None);
                    match session.change_rev_prop(
                        0,
                        LOCK_PROP,
                        expected_old,
                        Some(token.as_bytes()),
                    ) {
                        Ok(()) => {}
                        Err(TransportError::PropBaseValueMismatch { .. }) if atomic => {
                            tracing::debug!("lock was taken concurrently");
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
            }
        }
    }

    Err(LoadError::LockUnavailable {
        attempts: options.retries,
    })
}

/// Removes the lock, unless someone else has taken it in the meantime.
pub(crate) fn release<S: Session>(
    session: &mut S,
    lock: &OperationalLock,
) -> Result<(), LoadError> {
    let holder = session.rev_prop(0, LOCK_PROP)?;
    if holder.as_deref() != Some(lock.token.as_bytes()) {
        tracing::warn!(
            "lock {:?} is no longer held, found {:?}",
            lock.token,
            holder.as_deref().map(String::from_utf8_lossy),
        );
        return Ok(());
    }

    let expected_old = lock.atomic.then_some(Some(lock.token.as_bytes()));
    session.change_rev_prop(0, LOCK_PROP, expected_old, None)?;
    tracing::info!("released lock {:?}", lock.token);
    Ok(())
}
