use time::OffsetDateTime;

use crate::error::{MetabaseError, Result};

/// Write-protection mode of a retention period.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum RetentionMode {
    #[default]
    None,
    /// Cannot be bypassed before `retain_until`.
    Compliance,
    /// Can be bypassed with an explicit privilege.
    Governance,
}

impl RetentionMode {
    pub fn to_db(self) -> i64 {
        match self {
            RetentionMode::None => 0,
            RetentionMode::Compliance => 1,
            RetentionMode::Governance => 2,
        }
    }

    pub fn from_db(raw: i64) -> Result<Self> {
        match raw {
            0 => Ok(RetentionMode::None),
            1 => Ok(RetentionMode::Compliance),
            2 => Ok(RetentionMode::Governance),
            _ => Err(MetabaseError::Encoding(format!("retention mode {raw}"))),
        }
    }
}

/// Time-bounded write protection carried on an object row.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct Retention {
    pub mode: RetentionMode,
    pub retain_until: Option<OffsetDateTime>,
}

impl Retention {
    pub fn compliance(until: OffsetDateTime) -> Self {
        Retention {
            mode: RetentionMode::Compliance,
            retain_until: Some(until),
        }
    }

    pub fn governance(until: OffsetDateTime) -> Self {
        Retention {
            mode: RetentionMode::Governance,
            retain_until: Some(until),
        }
    }

    pub fn enabled(&self) -> bool {
        self.mode != RetentionMode::None
    }

    /// Whether the retention period still protects the object at `now`.
    pub fn active(&self, now: OffsetDateTime) -> bool {
        self.enabled() && self.retain_until.map_or(false, |until| until > now)
    }

    /// Mode and deadline must be set together.
    pub fn verify(&self) -> Result<()> {
        match (self.enabled(), self.retain_until.is_some()) {
            (true, false) => Err(MetabaseError::invalid("retention period missing deadline")),
            (false, true) => Err(MetabaseError::invalid("retention deadline without mode")),
            _ => Ok(()),
        }
    }
}

/// Inputs to the destructive-action lock check.
#[derive(Clone, Copy, Debug)]
pub struct LockCheck {
    pub retention: Retention,
    pub legal_hold: bool,
    pub bypass_governance: bool,
}

/// Gate applied before any destructive action on an existing object. Legal
/// hold blocks unconditionally; compliance retention blocks until expiry;
/// governance retention blocks unless the caller carries the bypass
/// privilege.
pub fn check_removal(check: LockCheck, now: OffsetDateTime) -> Result<()> {
    if check.legal_hold {
        return Err(MetabaseError::ObjectLock("locked by legal hold"));
    }
    if check.retention.active(now) {
        match check.retention.mode {
            RetentionMode::Compliance => {
                return Err(MetabaseError::ObjectLock("locked by compliance retention"))
            }
            RetentionMode::Governance if !check.bypass_governance => {
                return Err(MetabaseError::ObjectLock("locked by governance retention"))
            }
            _ => {}
        }
    }
    Ok(())
}

/// TTL and lock state are mutually exclusive on a single object.
pub(crate) fn verify_lock_and_expiry(
    expires_at: Option<OffsetDateTime>,
    retention: &Retention,
    legal_hold: bool,
) -> Result<()> {
    retention.verify()?;
    if expires_at.is_some() && retention.enabled() {
        return Err(MetabaseError::invalid(
            "object expiration and retention cannot both be set",
        ));
    }
    if expires_at.is_some() && legal_hold {
        return Err(MetabaseError::invalid(
            "object expiration and legal hold cannot both be set",
        ));
    }
    Ok(())
}
