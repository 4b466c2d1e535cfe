// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use anyhow::anyhow;

/// Errno attached as context to governor errors that callers are expected
/// to tell apart, e.g. a transient EBUSY which should simply be retried on
/// the next decision cycle.
///
/// ```rust
/// use cpugov::GovErrno;
/// let err = anyhow::anyhow!("cluster switch in progress").context(GovErrno(libc::EBUSY));
/// assert_eq!(GovErrno::of(&err), Some(libc::EBUSY));
/// ```
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct GovErrno(pub i32);

impl GovErrno {
    /// Errno carried by `err`, if any.
    pub fn of(err: &anyhow::Error) -> Option<i32> {
        err.downcast_ref::<GovErrno>().map(|e| e.0)
    }

    pub fn is_busy(err: &anyhow::Error) -> bool {
        Self::of(err) == Some(libc::EBUSY)
    }
}

impl std::fmt::Display for GovErrno {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", std::io::Error::from_raw_os_error(self.0))
    }
}

impl std::fmt::Debug for GovErrno {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", std::io::Error::from_raw_os_error(self.0))
    }
}

pub(crate) fn busy(what: impl std::fmt::Display) -> anyhow::Error {
    anyhow!("{}", what).context(GovErrno(libc::EBUSY))
}

pub(crate) fn invalid(what: impl std::fmt::Display) -> anyhow::Error {
    anyhow!("{}", what).context(GovErrno(libc::EINVAL))
}
