//! Ownership checks for answer and comment edits.

use crate::models::{Answer, Comment, Id};
use crate::repo::RepoError;

/// Records with a single owning author.
pub trait Authored {
    fn author_id(&self) -> Id;
}

impl Authored for Answer {
    fn author_id(&self) -> Id {
        self.author_id
    }
}

impl Authored for Comment {
    fn author_id(&self) -> Id {
        self.author_id
    }
}

/// Only the author may edit. Staff get no override.
pub fn can_edit<R: Authored + ?Sized>(user_id: Id, record: &R) -> bool {
    user_id == record.author_id()
}

/// Steps 2 and 3 of the edit protocol, run once the record has resolved.
pub fn authorize_edit<R: Authored + ?Sized>(
    user_id: Id,
    record: &R,
    locked_field: Option<&'static str>,
) -> Result<(), RepoError> {
    if !can_edit(user_id, record) {
        return Err(RepoError::Forbidden);
    }
    if let Some(field) = locked_field {
        return Err(RepoError::Validation(format!("field '{field}' cannot be updated")));
    }
    Ok(())
}
