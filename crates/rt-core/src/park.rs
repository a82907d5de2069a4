// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

mod parker;

use cfg_if::cfg_if;

pub use parker::{Parker, UnparkToken};

/// A mechanism for suspending the calling thread until there is more work to
/// do, and for waking it back up from another thread.
///
/// Every executor shape in this crate owns exactly one [`Parker`] built on
/// top of one `Park` implementation, so there is no need to track capacity
/// across many parked threads the way a multi-worker pool would.
pub trait Park {
    fn park(&self);
    fn unpark(&self);
}

cfg_if! {
    if #[cfg(feature = "std")] {
        pub struct StdPark(crate::loom::thread::Thread);

        impl Park for StdPark {
            fn park(&self) {
                tracing::trace!("parking current thread ({:?})...", self.0);
                crate::loom::thread::park();
            }

            fn unpark(&self) {
                tracing::trace!("unparking thread {:?}...", self.0);
                self.0.unpark();
            }
        }

        impl StdPark {
            pub fn for_current() -> Self {
                Self(crate::loom::thread::current())
            }
        }
    }
}
