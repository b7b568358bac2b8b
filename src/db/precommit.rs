//! The transactional read-then-write protocol run at the heart of commits and
//! deletes: after `precommit_query` snapshots the target key's state, these
//! helpers enforce conditional-write and lock rules and clear the unversioned
//! incumbent out of the way.

use time::OffsetDateTime;
use tracing::debug;

use crate::adapter::{AdapterTx, PrecommitInfo};
use crate::db::commit::IfNoneMatch;
use crate::error::{MetabaseError, Result};
use crate::model::{check_removal, LockCheck, Object, Version};

/// What happened to the unversioned incumbent during precommit.
pub(crate) enum IncumbentAction {
    /// No incumbent, or the bucket is versioned.
    Untouched,
    /// The incumbent is the newest visible row; the commit will overwrite it
    /// in place, keeping its version number. Its segments are already gone.
    Reuse(Object),
    /// The incumbent row and its segments were deleted.
    Removed(Object),
}

/// Fails a conditional write when a committed row already occupies the key.
/// A delete marker as the newest row counts as absent.
pub(crate) fn check_if_none_match(
    if_none_match: Option<IfNoneMatch>,
    info: &PrecommitInfo,
) -> Result<()> {
    match if_none_match {
        None => Ok(()),
        Some(IfNoneMatch::All) => match info.highest_visible {
            Some((_, status)) if status.is_committed() => Err(MetabaseError::FailedPrecondition(
                "object already exists".into(),
            )),
            _ => Ok(()),
        },
    }
}

/// Clears the unversioned incumbent ahead of an unversioned commit. The lock
/// gate applies whether the row is replaced or overwritten in place; a
/// delete marker incumbent passes it trivially.
pub(crate) fn resolve_unversioned_incumbent(
    tx: &mut dyn AdapterTx,
    info: &PrecommitInfo,
    versioned: bool,
    disallow_delete: bool,
    now: OffsetDateTime,
) -> Result<IncumbentAction> {
    if versioned {
        return Ok(IncumbentAction::Untouched);
    }
    let Some(incumbent) = &info.unversioned else {
        return Ok(IncumbentAction::Untouched);
    };

    check_removal(
        LockCheck {
            retention: incumbent.retention,
            legal_hold: incumbent.legal_hold,
            bypass_governance: false,
        },
        now,
    )?;
    if disallow_delete {
        return Err(MetabaseError::PermissionDenied(
            "object overwrite would delete existing object",
        ));
    }

    let reuse = info
        .highest_visible
        .map_or(false, |(version, _)| version == incumbent.version());
    if reuse {
        let deleted = tx.delete_segments(incumbent.stream_id())?;
        debug!(
            version = incumbent.version().0,
            segments = deleted,
            "precommit.reuse_unversioned"
        );
        return Ok(IncumbentAction::Reuse(incumbent.clone()));
    }

    tx.delete_object(incumbent.location(), incumbent.version())?;
    let deleted = tx.delete_segments(incumbent.stream_id())?;
    debug!(
        version = incumbent.version().0,
        segments = deleted,
        "precommit.delete_unversioned"
    );
    Ok(IncumbentAction::Removed(incumbent.clone()))
}

/// The version a commit publishes under. The pending row participates in
/// `highest`, so an untouched key keeps its begin-time version; anything
/// assigned since then pushes the commit past it.
pub(crate) fn committed_version(pending_version: Version, highest: Version) -> Version {
    if highest > pending_version {
        highest.next()
    } else {
        pending_version
    }
}
