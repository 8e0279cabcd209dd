/// Mode resolution: which upstream should a user's port serve right now.
///
/// Order is fixed: first schedule window that matches the user's local
/// clock wins (lowest schedule id on ties), then the explicitly active
/// mode, then nothing.
use std::sync::Arc;

use anyhow::Result;
use chrono::{NaiveTime, Utc};
use chrono_tz::Tz;
use tracing::debug;

use crate::db::{Mode, Repository, User};

/// What a port should dial. Sleep means "answer and hang up".
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedMode {
    Sleep,
    Live {
        host: String,
        port: u16,
        alias: String,
        name: String,
    },
}

impl ResolvedMode {
    pub fn from_mode(mode: &Mode) -> Self {
        if mode.is_sleep() {
            ResolvedMode::Sleep
        } else {
            ResolvedMode::Live {
                host: mode.host.clone(),
                port: mode.port,
                alias: mode.alias.clone(),
                name: mode.name.clone(),
            }
        }
    }
}

/// Current wall clock in the user's timezone. Unknown zone names fall
/// back to UTC rather than failing the resolver.
pub fn local_now(user: &User) -> NaiveTime {
    let tz: Tz = match user.timezone.parse() {
        Ok(tz) => tz,
        Err(_) => {
            debug!(
                "user {} has unparseable timezone '{}', using UTC",
                user.id, user.timezone
            );
            chrono_tz::UTC
        }
    };
    Utc::now().with_timezone(&tz).time()
}

fn parse_hhmm(s: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(s.trim(), "%H:%M").ok()
}

/// Window membership for "HH:MM" bounds. Equal bounds match all day;
/// start > end wraps past midnight. Unparseable bounds never match.
pub fn time_in_window(now: NaiveTime, start: &str, end: &str) -> bool {
    let (start, end) = match (parse_hhmm(start), parse_hhmm(end)) {
        (Some(s), Some(e)) => (s, e),
        _ => return false,
    };
    if start == end {
        return true;
    }
    if start < end {
        start <= now && now <= end
    } else {
        now >= start || now <= end
    }
}

/// First schedule whose window contains the user's local time, resolved
/// to its mode. Schedules pointing at deleted or foreign modes are
/// skipped as non-matching.
pub async fn scheduled_mode(repo: &Arc<dyn Repository>, user: &User) -> Result<Option<Mode>> {
    let now = local_now(user);
    scheduled_mode_at(repo, user, now).await
}

pub async fn scheduled_mode_at(
    repo: &Arc<dyn Repository>,
    user: &User,
    now: NaiveTime,
) -> Result<Option<Mode>> {
    let mut schedules = repo.schedules_of(user.id).await?;
    schedules.sort_by_key(|s| s.id);
    for schedule in &schedules {
        if !time_in_window(now, &schedule.start_time, &schedule.end_time) {
            continue;
        }
        if let Some(mode) = repo.find_mode(user.id, schedule.mode_id).await? {
            return Ok(Some(mode));
        }
    }
    Ok(None)
}

/// The mode in effect for the user right now: schedule match first,
/// then the persisted active mode.
pub async fn effective_mode(repo: &Arc<dyn Repository>, user: &User) -> Result<Option<Mode>> {
    if let Some(mode) = scheduled_mode(repo, user).await? {
        return Ok(Some(mode));
    }
    repo.active_mode(user.id).await
}
