use sema_core::error::BotError;
use sema_core::helpers::dto::{ChatChannel, OutboundMessage};
use sema_core::helpers::utils::{days_between, same_calendar_day};

use crate::ledger::handler::UserLedger;
use crate::transport::Transports;

/// Tokens granted on every 7-day streak milestone.
pub const STREAK_BONUS_TOKENS: u64 = 5;
const MILESTONE_DAYS: u64 = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreakUpdate {
    pub streak: u64,
    pub bonus_granted: bool,
}

/// Derives daily-engagement streaks from activity timestamps. All storage
/// goes through the ledger's CAS update, so the streak math, the bonus
/// credit and the activity stamp land as one atomic document write.
#[derive(Clone)]
pub struct StreakTracker {
    ledger: UserLedger,
}

impl StreakTracker {
    pub fn new(ledger: UserLedger) -> Self {
        Self { ledger }
    }

    /// Called on every qualifying user activity. Same-day repeats never
    /// change the streak; a gap of two or more calendar days resets it.
    pub fn record_activity(&self, user_id: &str, now: i64) -> Result<StreakUpdate, BotError> {
        let mut update = StreakUpdate {
            streak: 0,
            bonus_granted: false,
        };
        self.ledger.update(user_id, |user| {
            let previous = user.streak_count;
            user.streak_count = match user.last_active_at {
                None => 1,
                Some(last) if same_calendar_day(last, now) => previous,
                Some(last) if days_between(last, now) == 1 => previous + 1,
                Some(_) => 1,
            };

            let rewarded_today = user
                .last_streak_reward_at
                .map(|ts| same_calendar_day(ts, now))
                .unwrap_or(false);
            let milestone =
                user.streak_count > 0 && user.streak_count % MILESTONE_DAYS == 0;
            if milestone && !rewarded_today {
                user.token_balance = user.token_balance.saturating_add(STREAK_BONUS_TOKENS);
                user.last_streak_reward_at = Some(now);
                update.bonus_granted = true;
            } else {
                update.bonus_granted = false;
            }

            user.last_active_at = Some(now);
            update.streak = user.streak_count;
            Ok(())
        })?;
        Ok(update)
    }

    /// Daily maintenance: users inactive since before yesterday lose their
    /// streak. Not part of the hot path.
    pub fn reset_lapsed(&self, now: i64) -> Result<usize, BotError> {
        let mut reset = 0;
        for user in self.ledger.iter() {
            let lapsed = match user.last_active_at {
                Some(last) => user.streak_count > 0 && days_between(last, now) >= 2,
                None => false,
            };
            if !lapsed {
                continue;
            }
            self.ledger.update(&user.id, |u| {
                u.streak_count = 0;
                Ok(())
            })?;
            reset += 1;
        }
        Ok(reset)
    }

    /// Daily maintenance: nudge users with a live streak who have not been
    /// active today and have not already been reminded today.
    pub async fn remind_pending(&self, now: i64, transports: &Transports) -> Result<usize, BotError> {
        let mut reminded = 0;
        for user in self.ledger.iter() {
            if user.streak_count == 0 {
                continue;
            }
            let active_today = user
                .last_active_at
                .map(|ts| same_calendar_day(ts, now))
                .unwrap_or(false);
            let reminded_today = user
                .last_streak_reminder_at
                .map(|ts| same_calendar_day(ts, now))
                .unwrap_or(false);
            if active_today || reminded_today {
                continue;
            }
            let channel = match ChatChannel::from_user_id(&user.id) {
                Some(channel) => channel,
                None => continue,
            };

            let notice = OutboundMessage {
                channel,
                user_id: user.id.clone(),
                text: format!(
                    "🔥 Your {}-day streak is on the line! Send a message today to keep it alive.",
                    user.streak_count
                ),
            };
            if let Err(e) = transports.deliver(&notice).await {
                log::warn!("streak reminder to {} failed: {}", user.id, e);
                continue;
            }
            self.ledger.update(&user.id, |u| {
                u.last_streak_reminder_at = Some(now);
                Ok(())
            })?;
            reminded += 1;
        }
        Ok(reminded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::dto::STARTING_TOKENS;

    const DAY: i64 = 86_400;
    // 2024-05-01 12:00:00 UTC, comfortably mid-day.
    const T0: i64 = 1_714_564_800;

    fn fixtures() -> (StreakTracker, UserLedger) {
        let db = sled::Config::new().temporary(true).open().unwrap();
        let ledger = UserLedger::new(&db).unwrap();
        ledger.create_if_absent("tg:1", "Ada").unwrap();
        (StreakTracker::new(ledger.clone()), ledger)
    }

    #[test]
    fn test_first_activity_starts_streak() {
        let (streaks, _) = fixtures();
        let update = streaks.record_activity("tg:1", T0).unwrap();
        assert_eq!(update.streak, 1);
        assert!(!update.bonus_granted);
    }

    #[test]
    fn test_same_day_repeats_never_change_streak() {
        let (streaks, _) = fixtures();
        streaks.record_activity("tg:1", T0).unwrap();
        for offset in [60, 3600, 7 * 3600] {
            let update = streaks.record_activity("tg:1", T0 + offset).unwrap();
            assert_eq!(update.streak, 1);
        }
    }

    #[test]
    fn test_consecutive_days_increment() {
        let (streaks, _) = fixtures();
        streaks.record_activity("tg:1", T0).unwrap();
        let update = streaks.record_activity("tg:1", T0 + DAY).unwrap();
        assert_eq!(update.streak, 2);
    }

    #[test]
    fn test_gap_resets_to_one() {
        let (streaks, _) = fixtures();
        streaks.record_activity("tg:1", T0).unwrap();
        streaks.record_activity("tg:1", T0 + DAY).unwrap();
        let update = streaks.record_activity("tg:1", T0 + 4 * DAY).unwrap();
        assert_eq!(update.streak, 1);
    }

    #[test]
    fn test_milestone_bonus_once_per_day() {
        let (streaks, ledger) = fixtures();
        for day in 0..7 {
            streaks.record_activity("tg:1", T0 + day * DAY).unwrap();
        }
        let user = ledger.get_required("tg:1").unwrap();
        assert_eq!(user.streak_count, 7);
        assert_eq!(user.token_balance, STARTING_TOKENS + STREAK_BONUS_TOKENS);

        // A later activity the same day hits the milestone check again but
        // must not re-grant.
        streaks.record_activity("tg:1", T0 + 6 * DAY + 3600).unwrap();
        assert_eq!(
            ledger.get_required("tg:1").unwrap().token_balance,
            STARTING_TOKENS + STREAK_BONUS_TOKENS
        );
    }

    #[test]
    fn test_reset_lapsed_only_touches_stale_streaks() {
        let (streaks, ledger) = fixtures();
        ledger.create_if_absent("wa:2", "Bisi").unwrap();
        streaks.record_activity("tg:1", T0).unwrap();
        streaks.record_activity("wa:2", T0 + 2 * DAY).unwrap();

        let reset = streaks.reset_lapsed(T0 + 3 * DAY).unwrap();
        assert_eq!(reset, 1);
        assert_eq!(ledger.get_required("tg:1").unwrap().streak_count, 0);
        assert_eq!(ledger.get_required("wa:2").unwrap().streak_count, 1);
    }
}
