//! What a wait is waiting for

use std::sync::Weak;

use crate::dispatcher::{Dispatcher, OwnerId};
use crate::request::RecordCell;

/// Completion condition of one execute call, evaluated against the
/// caller's own requests only
pub(crate) enum WaitCondition {
    /// Every request has been transmitted; a `noWait` request completes then
    Sent,
    All,
    Any,
    /// This request is no longer in flight
    One(Weak<RecordCell>),
    /// Like `Any`, but the run may also stop on its time budget
    Blocked,
}

impl WaitCondition {
    pub(crate) fn satisfied(&self, dispatcher: &Dispatcher, owner: OwnerId) -> bool {
        let todo = dispatcher.todo(owner);
        match self {
            WaitCondition::Sent => todo == 0 || dispatcher.all_sent(owner),
            WaitCondition::All => todo == 0,
            WaitCondition::Any | WaitCondition::Blocked => {
                todo == 0 || dispatcher.completed_len(owner) > 0
            }
            WaitCondition::One(record) => match record.upgrade() {
                Some(cell) => {
                    let rec = cell.lock();
                    !rec.in_progress
                }
                None => true,
            },
        }
    }
}

impl std::fmt::Debug for WaitCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            WaitCondition::Sent => "sent",
            WaitCondition::All => "all",
            WaitCondition::Any => "any",
            WaitCondition::One(_) => "one",
            WaitCondition::Blocked => "blocked",
        };
        f.write_str(name)
    }
}
