//! Account-wide entry gating.
//!
//! The governor owns the single `RiskState` of a run. It never closes a
//! position; it only vetoes new ones. Rules, in order:
//! 1. Active cooldown
//! 2. Consecutive-loss threshold (starts a cooldown)
//! 3. Weekly loss cap
//! 4. Daily loss cap (optional)

use chrono::{DateTime, Datelike, Duration, NaiveTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::RiskConfig;
use crate::strategy::{AccountMode, AccountSnapshot};

/// Shared account state, mutated only at tick boundaries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskState {
    pub equity: Decimal,
    pub consecutive_losses: u32,
    pub cooldown_until: Option<DateTime<Utc>>,
    pub weekly_pnl: Decimal,
    pub week_start: Option<DateTime<Utc>>,
    pub week_start_equity: Decimal,
    pub daily_pnl: Decimal,
    pub day_start: Option<DateTime<Utc>>,
    pub day_start_equity: Decimal,
}

impl RiskState {
    pub fn new(equity: Decimal) -> Self {
        Self {
            equity,
            consecutive_losses: 0,
            cooldown_until: None,
            weekly_pnl: Decimal::ZERO,
            week_start: None,
            week_start_equity: equity,
            daily_pnl: Decimal::ZERO,
            day_start: None,
            day_start_equity: equity,
        }
    }
}

/// Why new entries are currently blocked.
#[derive(Debug, Clone, PartialEq, thiserror::Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RiskVeto {
    #[error("cooldown active until {until}")]
    Cooldown { until: DateTime<Utc> },
    #[error("{losses} consecutive losses, cooldown until {until}")]
    ConsecutiveLosses { losses: u32, until: DateTime<Utc> },
    #[error("weekly loss cap: pnl {weekly_pnl} at or below {limit}")]
    WeeklyLossCap { weekly_pnl: Decimal, limit: Decimal },
    #[error("daily loss cap: pnl {daily_pnl} at or below {limit}")]
    DailyLossCap { daily_pnl: Decimal, limit: Decimal },
}

/// Governor state transitions worth reporting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RiskEventKind {
    CooldownStarted { losses: u32, until: DateTime<Utc> },
    CooldownExpired,
    WeeklyCapHit { weekly_pnl: Decimal, limit: Decimal },
    DailyCapHit { daily_pnl: Decimal, limit: Decimal },
    WeekRolled { previous_pnl: Decimal, week_start: DateTime<Utc> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskEvent {
    pub timestamp: DateTime<Utc>,
    pub equity: Decimal,
    pub event: RiskEventKind,
}

impl RiskEvent {
    /// Emit as structured log for downstream parsing.
    pub fn emit(&self) {
        let json = serde_json::to_string(self).unwrap_or_default();
        match self.event {
            RiskEventKind::CooldownStarted { .. }
            | RiskEventKind::WeeklyCapHit { .. }
            | RiskEventKind::DailyCapHit { .. } => {
                warn!(target: "risk_event", "RISK_EVENT: {}", json)
            }
            RiskEventKind::CooldownExpired | RiskEventKind::WeekRolled { .. } => {
                info!(target: "risk_event", "RISK_EVENT: {}", json)
            }
        }
    }
}

/// Monday 00:00 UTC of the week containing `t`.
pub fn week_start_of(t: DateTime<Utc>) -> DateTime<Utc> {
    let monday = t.date_naive() - Duration::days(i64::from(t.weekday().num_days_from_monday()));
    monday.and_time(NaiveTime::MIN).and_utc()
}

/// 00:00 UTC of the day containing `t`.
pub fn day_start_of(t: DateTime<Utc>) -> DateTime<Utc> {
    t.date_naive().and_time(NaiveTime::MIN).and_utc()
}

pub struct RiskGovernor {
    config: RiskConfig,
    initial_equity: Decimal,
    state: RiskState,
    weekly_cap_reported: bool,
    daily_cap_reported: bool,
    events: Vec<RiskEvent>,
}

impl RiskGovernor {
    pub fn new(config: RiskConfig, initial_equity: Decimal) -> Self {
        Self {
            config,
            initial_equity,
            state: RiskState::new(initial_equity),
            weekly_cap_reported: false,
            daily_cap_reported: false,
            events: Vec::new(),
        }
    }

    pub fn state(&self) -> &RiskState {
        &self.state
    }

    pub fn equity(&self) -> Decimal {
        self.state.equity
    }

    pub fn initial_equity(&self) -> Decimal {
        self.initial_equity
    }

    pub fn events(&self) -> &[RiskEvent] {
        &self.events
    }

    pub fn into_events(self) -> Vec<RiskEvent> {
        self.events
    }

    fn cooldown(&self) -> Duration {
        Duration::hours(i64::from(self.config.cooldown_hours))
    }

    fn record(&mut self, timestamp: DateTime<Utc>, event: RiskEventKind) {
        let event = RiskEvent {
            timestamp,
            equity: self.state.equity,
            event,
        };
        event.emit();
        self.events.push(event);
    }

    /// Calendar bookkeeping at the start of every tick: week and day
    /// rollover, cooldown expiry.
    pub fn on_tick(&mut self, now: DateTime<Utc>) {
        let week = week_start_of(now);
        match self.state.week_start {
            None => {
                self.state.week_start = Some(week);
                self.state.week_start_equity = self.state.equity;
            }
            Some(current) if week > current => {
                let previous_pnl = self.state.weekly_pnl;
                self.state.week_start = Some(week);
                self.state.week_start_equity = self.state.equity;
                self.state.weekly_pnl = Decimal::ZERO;
                self.weekly_cap_reported = false;
                self.record(now, RiskEventKind::WeekRolled { previous_pnl, week_start: week });
            }
            Some(_) => {}
        }

        let day = day_start_of(now);
        if self.state.day_start.map_or(true, |current| day > current) {
            self.state.day_start = Some(day);
            self.state.day_start_equity = self.state.equity;
            self.state.daily_pnl = Decimal::ZERO;
            self.daily_cap_reported = false;
        }

        if let Some(until) = self.state.cooldown_until {
            if now >= until {
                self.state.cooldown_until = None;
                self.state.consecutive_losses = 0;
                self.record(now, RiskEventKind::CooldownExpired);
            }
        }
    }

    /// Gate a new entry at `now`.
    pub fn can_open(&mut self, now: DateTime<Utc>) -> Result<(), RiskVeto> {
        if let Some(until) = self.state.cooldown_until {
            if now < until {
                return Err(RiskVeto::Cooldown { until });
            }
        }

        if self.config.max_consecutive_losses > 0
            && self.state.consecutive_losses >= self.config.max_consecutive_losses
        {
            let until = now + self.cooldown();
            let losses = self.state.consecutive_losses;
            self.state.cooldown_until = Some(until);
            self.record(now, RiskEventKind::CooldownStarted { losses, until });
            return Err(RiskVeto::ConsecutiveLosses { losses, until });
        }

        let weekly_limit = -self.config.max_weekly_loss * self.state.week_start_equity;
        if self.state.weekly_pnl <= weekly_limit {
            let weekly_pnl = self.state.weekly_pnl;
            if !self.weekly_cap_reported {
                self.weekly_cap_reported = true;
                self.record(now, RiskEventKind::WeeklyCapHit { weekly_pnl, limit: weekly_limit });
            }
            return Err(RiskVeto::WeeklyLossCap { weekly_pnl, limit: weekly_limit });
        }

        if let Some(max_daily) = self.config.max_daily_loss {
            let daily_limit = -max_daily * self.state.day_start_equity;
            if self.state.daily_pnl <= daily_limit {
                let daily_pnl = self.state.daily_pnl;
                if !self.daily_cap_reported {
                    self.daily_cap_reported = true;
                    self.record(now, RiskEventKind::DailyCapHit { daily_pnl, limit: daily_limit });
                }
                return Err(RiskVeto::DailyLossCap { daily_pnl, limit: daily_limit });
            }
        }

        Ok(())
    }

    /// Book a fully closed trade's net P&L.
    pub fn record_close(&mut self, pnl: Decimal, closed_at: DateTime<Utc>) {
        self.state.equity += pnl;
        self.state.weekly_pnl += pnl;
        self.state.daily_pnl += pnl;

        if pnl > Decimal::ZERO {
            self.state.consecutive_losses = 0;
        } else if pnl < Decimal::ZERO {
            self.state.consecutive_losses += 1;
            let threshold = self.config.max_consecutive_losses;
            if threshold > 0
                && self.state.consecutive_losses >= threshold
                && self.state.cooldown_until.is_none()
            {
                let until = closed_at + self.cooldown();
                let losses = self.state.consecutive_losses;
                self.state.cooldown_until = Some(until);
                self.record(closed_at, RiskEventKind::CooldownStarted { losses, until });
            }
        }
    }

    /// Account view handed to the oracle.
    pub fn snapshot(&self, open_positions: usize) -> AccountSnapshot {
        let equity = self.state.equity;
        let daily_pnl = self.state.daily_pnl;
        let mode = if daily_pnl < -equity * dec!(0.01) || equity < self.initial_equity * dec!(0.98) {
            AccountMode::Drawdown
        } else if daily_pnl > equity * dec!(0.02) {
            AccountMode::HotStreak
        } else {
            AccountMode::Normal
        };

        AccountSnapshot {
            equity,
            initial_equity: self.initial_equity,
            open_positions,
            consecutive_losses: self.state.consecutive_losses,
            weekly_pnl: self.state.weekly_pnl,
            daily_pnl,
            mode,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(day: u32, hour: u32) -> DateTime<Utc> {
        // March 2024: the 4th is a Monday
        Utc.with_ymd_and_hms(2024, 3, day, hour, 0, 0).unwrap()
    }

    fn governor() -> RiskGovernor {
        RiskGovernor::new(RiskConfig::default(), dec!(10000))
    }

    // =========================================================================
    // Calendar Tests
    // =========================================================================

    #[test]
    fn test_week_start_is_monday_midnight() {
        assert_eq!(week_start_of(at(6, 15)), at(4, 0));
        assert_eq!(week_start_of(at(4, 0)), at(4, 0));
        assert_eq!(week_start_of(at(10, 23)), at(4, 0));
        assert_eq!(week_start_of(at(11, 0)), at(11, 0));
        assert_eq!(day_start_of(at(6, 15)), at(6, 0));
    }

    // =========================================================================
    // Cooldown Tests
    // =========================================================================

    #[test]
    fn test_cooldown_after_three_losses() {
        let mut gov = governor();
        gov.on_tick(at(5, 0));
        gov.record_close(dec!(-50), at(5, 1));
        gov.record_close(dec!(-50), at(5, 2));
        assert!(gov.can_open(at(5, 2)).is_ok());

        gov.on_tick(at(5, 3));
        gov.record_close(dec!(-50), at(5, 3));
        assert_eq!(gov.state().cooldown_until, Some(at(5, 15)));

        for hour in [3, 8, 14] {
            gov.on_tick(at(5, hour));
            assert!(matches!(gov.can_open(at(5, hour)), Err(RiskVeto::Cooldown { .. })));
        }

        gov.on_tick(at(5, 15));
        assert!(gov.can_open(at(5, 15)).is_ok());
        assert_eq!(gov.state().consecutive_losses, 0);
        assert!(gov
            .events()
            .iter()
            .any(|e| matches!(e.event, RiskEventKind::CooldownExpired)));
    }

    #[test]
    fn test_win_resets_loss_streak() {
        let mut gov = governor();
        gov.on_tick(at(5, 0));
        gov.record_close(dec!(-10), at(5, 1));
        gov.record_close(dec!(-10), at(5, 2));
        gov.record_close(dec!(25), at(5, 3));
        assert_eq!(gov.state().consecutive_losses, 0);
        gov.record_close(dec!(-10), at(5, 4));
        assert_eq!(gov.state().consecutive_losses, 1);
        assert!(gov.state().cooldown_until.is_none());
    }

    #[test]
    fn test_breakeven_leaves_streak_unchanged() {
        let mut gov = governor();
        gov.on_tick(at(5, 0));
        gov.record_close(dec!(-10), at(5, 1));
        gov.record_close(Decimal::ZERO, at(5, 2));
        assert_eq!(gov.state().consecutive_losses, 1);
    }

    #[test]
    fn test_threshold_without_cooldown_starts_one() {
        let mut gov = governor();
        gov.state.consecutive_losses = 3;
        match gov.can_open(at(5, 0)) {
            Err(RiskVeto::ConsecutiveLosses { losses, until }) => {
                assert_eq!(losses, 3);
                assert_eq!(until, at(5, 12));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(gov.can_open(at(5, 1)), Err(RiskVeto::Cooldown { .. })));
    }

    // =========================================================================
    // Loss Cap Tests
    // =========================================================================

    #[test]
    fn test_weekly_cap_blocks_until_rollover() {
        let mut gov = governor();
        gov.on_tick(at(5, 0));
        gov.record_close(dec!(-300), at(5, 1));
        gov.record_close(dec!(350), at(5, 2));
        gov.record_close(dec!(-650), at(5, 3));
        assert_eq!(gov.state().consecutive_losses, 1);
        assert_eq!(gov.state().weekly_pnl, dec!(-600));

        for day in [5, 7, 10] {
            gov.on_tick(at(day, 12));
            assert!(matches!(
                gov.can_open(at(day, 12)),
                Err(RiskVeto::WeeklyLossCap { .. })
            ));
        }

        gov.on_tick(at(11, 0));
        assert_eq!(gov.state().weekly_pnl, Decimal::ZERO);
        assert_eq!(gov.state().week_start_equity, dec!(9400));
        assert!(gov.can_open(at(11, 0)).is_ok());

        let cap_events = gov
            .events()
            .iter()
            .filter(|e| matches!(e.event, RiskEventKind::WeeklyCapHit { .. }))
            .count();
        assert_eq!(cap_events, 1);
    }

    #[test]
    fn test_weekly_cap_not_hit_above_limit() {
        let mut gov = governor();
        gov.on_tick(at(5, 0));
        gov.record_close(dec!(-599), at(5, 1));
        assert!(gov.can_open(at(5, 1)).is_ok());
    }

    #[test]
    fn test_daily_cap_when_configured() {
        let config = RiskConfig {
            max_daily_loss: Some(dec!(0.02)),
            ..RiskConfig::default()
        };
        let mut gov = RiskGovernor::new(config, dec!(10000));
        gov.on_tick(at(5, 0));
        gov.record_close(dec!(-200), at(5, 1));
        assert!(matches!(gov.can_open(at(5, 2)), Err(RiskVeto::DailyLossCap { .. })));

        gov.on_tick(at(6, 0));
        assert!(gov.can_open(at(6, 0)).is_ok());
    }

    // =========================================================================
    // Snapshot Tests
    // =========================================================================

    #[test]
    fn test_account_modes() {
        let mut gov = governor();
        gov.on_tick(at(5, 0));
        assert_eq!(gov.snapshot(0).mode, AccountMode::Normal);

        gov.record_close(dec!(250), at(5, 1));
        assert_eq!(gov.snapshot(0).mode, AccountMode::HotStreak);

        gov.on_tick(at(6, 0));
        gov.record_close(dec!(-150), at(6, 1));
        assert_eq!(gov.snapshot(1).mode, AccountMode::Drawdown);
        assert_eq!(gov.snapshot(1).open_positions, 1);
    }
}
