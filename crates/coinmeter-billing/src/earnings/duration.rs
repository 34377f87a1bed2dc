//! Session duration reconciliation rules

use chrono::{DateTime, Utc};

use coinmeter_common::{BillingConfig, DurationError, MeteringSession};

/// Duration from the session's own start/end timestamps
pub fn from_timestamps(
    session: &MeteringSession,
    max_plausible_secs: u64,
) -> Result<u64, DurationError> {
    let ended_at = session.ended_at.ok_or(DurationError::MissingEnd)?;
    let seconds = (ended_at - session.started_at).num_seconds();

    if seconds <= 0 {
        return Err(DurationError::NonPositive { seconds });
    }
    if seconds as u64 > max_plausible_secs {
        return Err(DurationError::Implausible {
            seconds,
            max: max_plausible_secs,
        });
    }
    Ok(seconds as u64)
}

/// Safe fallback when timestamps are unusable
///
/// Tries consumed coins, then debit count, then wall-clock age, then the
/// configured constant. Candidates above the plausibility cap are skipped.
pub fn fallback(session: &MeteringSession, config: &BillingConfig, now: DateTime<Utc>) -> u64 {
    let max = config.max_plausible_duration_secs;
    let per_minute = coinmeter_common::SECONDS_PER_MINUTE as u64;

    if session.total_consumed > 0 {
        let seconds = session.total_consumed.saturating_mul(per_minute) / config.cost_per_minute;
        if seconds > 0 && seconds <= max {
            return seconds;
        }
    }

    let by_count = u64::from(session.consumption_count).saturating_mul(per_minute);
    if by_count > 0 && by_count <= max {
        return by_count;
    }

    let age = session.age(now).num_seconds();
    if age > 0 && age as u64 <= max {
        return age as u64;
    }

    config.fallback_duration_secs
}
