use std::time::Duration;

use crate::load::{LoadOptions, LockOptions};
use crate::mem_repos::DEFAULT_ROOT_URL;

#[derive(Debug, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct LoadParams {
    #[serde(rename = "lock-retries", default = "default_lock_retries")]
    pub(crate) lock_retries: u32,
    #[serde(rename = "lock-retry-delay-ms", default = "default_lock_retry_delay_ms")]
    pub(crate) lock_retry_delay_ms: u64,
    #[serde(rename = "skip-revprops", default = "Vec::new")]
    pub(crate) skip_revprops: Vec<String>,
    #[serde(rename = "bypass-prop-validation", default = "false_")]
    pub(crate) bypass_prop_validation: bool,
    #[serde(rename = "root-url", default = "default_root_url")]
    pub(crate) root_url: String,
    /// Whether the destination offers atomic revision property changes.
    #[serde(rename = "atomic-revprops", default = "true_")]
    pub(crate) atomic_revprops: bool,
}

impl Default for LoadParams {
    fn default() -> Self {
        Self {
            lock_retries: default_lock_retries(),
            lock_retry_delay_ms: default_lock_retry_delay_ms(),
            skip_revprops: Vec::new(),
            bypass_prop_validation: false,
            root_url: default_root_url(),
            atomic_revprops: true,
        }
    }
}

impl LoadParams {
    pub(crate) fn to_options(&self) -> LoadOptions {
        LoadOptions {
            lock: LockOptions {
                retries: self.lock_retries,
                retry_delay: Duration::from_millis(self.lock_retry_delay_ms),
            },
            skip_revprops: self.skip_revprops.clone(),
            validate_props: !self.bypass_prop_validation,
        }
    }
}

#[inline(always)]
fn false_() -> bool {
    false
}

#[inline(always)]
fn true_() -> bool {
    true
}

fn default_lock_retries() -> u32 {
    LockOptions::default().retries
}

fn default_lock_retry_delay_ms() -> u64 {
    1000
}

fn default_root_url() -> String {
    DEFAULT_ROOT_URL.into()
}
