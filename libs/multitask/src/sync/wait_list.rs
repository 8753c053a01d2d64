// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::loom::sync::atomic::Ordering;
use crate::task::TaskRef;
use core::ptr::{self, NonNull};

/// An intrusive FIFO of parked tasks, linked through their headers.
///
/// Every blocking primitive keeps one of these behind a [`Lock`]. The list
/// owns the link of each task on it, so a task must only ever be on one list
/// (or the ready queue) at a time.
///
/// [`Lock`]: crate::sync::Lock
#[derive(Debug, Default)]
pub(crate) struct WaitList {
    head: Option<TaskRef>,
    tail: Option<TaskRef>,
    len: usize,
}

impl WaitList {
    pub(crate) const fn new() -> Self {
        Self {
            head: None,
            tail: None,
            len: 0,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    pub(crate) fn front(&self) -> Option<TaskRef> {
        self.head
    }

    pub(crate) fn push_back(&mut self, task: TaskRef) {
        set_next(task, None);
        match self.tail {
            Some(tail) => set_next(tail, Some(task)),
            None => self.head = Some(task),
        }
        self.tail = Some(task);
        self.len += 1;
    }

    pub(crate) fn push_front(&mut self, task: TaskRef) {
        set_next(task, self.head);
        if self.tail.is_none() {
            self.tail = Some(task);
        }
        self.head = Some(task);
        self.len += 1;
    }

    pub(crate) fn pop_front(&mut self) -> Option<TaskRef> {
        let head = self.head?;
        self.head = next(head);
        if self.head.is_none() {
            self.tail = None;
        }
        set_next(head, None);
        self.len -= 1;
        Some(head)
    }

    /// Moves all of `other` in front of this list, keeping its order.
    pub(crate) fn append_front(&mut self, other: &mut WaitList) {
        let (Some(head), Some(tail)) = (other.head, other.tail) else {
            return;
        };

        set_next(tail, self.head);
        if self.tail.is_none() {
            self.tail = Some(tail);
        }
        self.head = Some(head);
        self.len += other.len;
        *other = WaitList::new();
    }

    /// Unlinks and returns the first task matching `pred`.
    pub(crate) fn remove_first(&mut self, mut pred: impl FnMut(TaskRef) -> bool) -> Option<TaskRef> {
        let mut prev: Option<TaskRef> = None;
        let mut cur = self.head;

        while let Some(task) = cur {
            let after = next(task);
            if pred(task) {
                match prev {
                    Some(prev) => set_next(prev, after),
                    None => self.head = after,
                }
                if self.tail == Some(task) {
                    self.tail = prev;
                }
                set_next(task, None);
                self.len -= 1;
                return Some(task);
            }
            prev = Some(task);
            cur = after;
        }

        None
    }
}

// The owning lock orders every access, so the links themselves don't need
// to synchronize.
fn next(task: TaskRef) -> Option<TaskRef> {
    // Safety: tasks on a wait list are alive and parked
    let next = unsafe { task.header().as_ref() }.next.load(Ordering::Relaxed);
    NonNull::new(next).map(TaskRef::from_header)
}

fn set_next(task: TaskRef, next: Option<TaskRef>) {
    let next = next.map_or(ptr::null_mut(), |t| t.header().as_ptr());
    // Safety: see above
    unsafe { task.header().as_ref() }
        .next
        .store(next, Ordering::Relaxed);
}
