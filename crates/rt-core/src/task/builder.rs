// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::scheduler::Schedule;
use crate::task::{self, JoinHandle, TaskRef};
use core::any::type_name;
use core::future::Future;
use core::panic::Location;

/// Builds a task with optional debugging metadata before spawning it.
///
/// Most callers should reach for a scheduler's own `spawn` method; this is
/// for cases that want to name a task or attribute it to a specific call
/// site ahead of time, e.g. in a framework built on top of this crate.
pub struct TaskBuilder<'a, S> {
    scheduler: S,
    location: Option<Location<'a>>,
    name: Option<&'a str>,
}

impl<'a, S> TaskBuilder<'a, S>
where
    S: Schedule,
{
    pub(crate) fn new(scheduler: S) -> TaskBuilder<'a, S> {
        Self {
            scheduler,
            location: None,
            name: None,
        }
    }

    /// Overrides the name of tasks spawned by this builder.
    ///
    /// By default, tasks are unnamed.
    #[must_use]
    pub fn name(mut self, name: &'a str) -> Self {
        self.name = Some(name);
        self
    }

    /// Overrides the source code location associated with tasks spawned by
    /// this builder.
    ///
    /// By default, tasks inherit the source location of the call to
    /// [`spawn`](Self::spawn).
    #[must_use]
    pub fn location(mut self, location: Location<'a>) -> Self {
        self.location = Some(location);
        self
    }

    /// Spawns `future` as a task on this builder's scheduler.
    #[track_caller]
    pub fn spawn<F>(self, future: F) -> (TaskRef, JoinHandle<F::Output>)
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let loc = self.location.as_ref().unwrap_or_else(|| Location::caller());
        tracing::trace!(
            task.name = ?self.name,
            task.output = %type_name::<F::Output>(),
            loc.file = loc.file(),
            loc.line = loc.line(),
            loc.col = loc.column(),
            "spawning task",
        );

        task::spawn(self.scheduler, future)
    }
}
