//! A `Clone` that is known to be cheap.
//! SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later

use std::sync::{Arc, Weak};

/// Analogous to `Clone`, but guaranteed to be a reference count bump or a
/// handle copy, never a deep copy.
pub(crate) trait Dupe {
    /// A cheap copy of the object.
    #[must_use]
    fn dupe(&self) -> Self;
}

impl<T> Dupe for Arc<T> {
    #[inline]
    fn dupe(&self) -> Self {
        Self::clone(self)
    }
}

impl<T> Dupe for Weak<T> {
    #[inline]
    fn dupe(&self) -> Self {
        Self::clone(self)
    }
}
