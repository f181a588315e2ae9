//! Control surface shared between the cycle loop and an operator.
//!
//! The operator side may pause, resume, stop and reconfigure the farmer
//! and read its status. It never places or cancels orders.

use crate::config::{ConfigHandle, SettingChange, SettingError};
use crate::exchange::{Balance, OrderId, Side};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Notify};
use tracing::info;

/// Phase of the cycle loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CycleState {
    #[default]
    Idle,
    Opening,
    Hedging,
    Holding,
    Closing,
    Unwinding,
    Cooldown,
    Paused,
}

impl CycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CycleState::Idle => "IDLE",
            CycleState::Opening => "OPENING",
            CycleState::Hedging => "HEDGING",
            CycleState::Holding => "HOLDING",
            CycleState::Closing => "CLOSING",
            CycleState::Unwinding => "UNWINDING",
            CycleState::Cooldown => "COOLDOWN",
            CycleState::Paused => "PAUSED",
        }
    }

    /// Inside a cycle, between the first quote and the end of cooldown.
    pub fn in_cycle(&self) -> bool {
        !matches!(self, CycleState::Idle | CycleState::Paused)
    }
}

impl fmt::Display for CycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of the most recently completed cycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CycleSummary {
    pub side: Side,
    pub size: Decimal,
    pub price: Decimal,
    /// Both legs opened and closed: size * price * 2
    pub volume_usd: Decimal,
}

impl CycleSummary {
    pub fn new(side: Side, size: Decimal, price: Decimal) -> Self {
        Self {
            side,
            size,
            price,
            volume_usd: size * price * Decimal::TWO,
        }
    }
}

/// Collateral on both venues and equity change since startup.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AccountSnapshot {
    pub maker: Balance,
    pub taker: Balance,
    pub maker_pnl: Option<Decimal>,
    pub taker_pnl: Option<Decimal>,
    pub updated_at: DateTime<Utc>,
}

impl AccountSnapshot {
    pub fn total_pnl(&self) -> Option<Decimal> {
        Some(self.maker_pnl? + self.taker_pnl?)
    }
}

/// Snapshot published by the cycle loop.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CycleStatus {
    pub state: CycleState,
    pub cycles_completed: u64,
    pub side: Option<Side>,
    pub size: Decimal,
    pub open_price: Option<Decimal>,
    pub hedge_price: Option<Decimal>,
    pub bid_order: Option<OrderId>,
    pub ask_order: Option<OrderId>,
    pub close_order: Option<OrderId>,
    pub hold_until: Option<DateTime<Utc>>,
    pub cooldown_until: Option<DateTime<Utc>>,
    pub last_summary: Option<CycleSummary>,
    /// Refreshed at startup, after each cycle and on shutdown
    pub account: Option<AccountSnapshot>,
}

#[derive(Debug)]
struct Flags {
    enabled: AtomicBool,
    shutdown: AtomicBool,
    shutdown_notify: Notify,
}

/// Cloneable handle to the farmer's control flags and status.
#[derive(Clone)]
pub struct ControlHandle {
    flags: Arc<Flags>,
    status_tx: Arc<watch::Sender<CycleStatus>>,
    config: ConfigHandle,
}

impl ControlHandle {
    /// New handle. Trading starts enabled.
    pub fn new(config: ConfigHandle) -> Self {
        let (status_tx, _) = watch::channel(CycleStatus::default());
        Self {
            flags: Arc::new(Flags {
                enabled: AtomicBool::new(true),
                shutdown: AtomicBool::new(false),
                shutdown_notify: Notify::new(),
            }),
            status_tx: Arc::new(status_tx),
            config,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.flags.enabled.load(Ordering::SeqCst)
    }

    /// Stop starting new cycles. A cycle in flight finishes.
    pub fn pause(&self) {
        if self.flags.enabled.swap(false, Ordering::SeqCst) {
            info!("⏸️  Trading paused");
        }
    }

    pub fn resume(&self) {
        if !self.flags.enabled.swap(true, Ordering::SeqCst) {
            info!("▶️  Trading resumed");
        }
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.flags.shutdown.load(Ordering::SeqCst)
    }

    pub fn request_shutdown(&self) {
        self.flags.shutdown.store(true, Ordering::SeqCst);
        self.flags.shutdown_notify.notify_waiters();
    }

    /// Resolves once shutdown has been requested.
    pub async fn shutdown_requested(&self) {
        loop {
            let notified = self.flags.shutdown_notify.notified();
            if self.is_shutdown_requested() {
                return;
            }
            notified.await;
        }
    }

    pub fn config(&self) -> &ConfigHandle {
        &self.config
    }

    /// Apply a live tunable update.
    pub fn configure(&self, key: &str, values: &[&str]) -> Result<SettingChange, SettingError> {
        self.config.set(key, values)
    }

    pub fn status(&self) -> CycleStatus {
        self.status_tx.borrow().clone()
    }

    /// Receiver notified on every status change.
    pub fn subscribe(&self) -> watch::Receiver<CycleStatus> {
        self.status_tx.subscribe()
    }

    pub(crate) fn update_status(&self, update: impl FnOnce(&mut CycleStatus)) {
        self.status_tx.send_modify(update);
    }

    /// Human-readable status for an operator.
    pub fn status_report(&self) -> String {
        let status = self.status();
        let mut lines = vec![
            format!(
                "State: {}{}",
                status.state,
                if self.is_enabled() { "" } else { " (disabled)" }
            ),
            format!("Cycles completed: {}", status.cycles_completed),
        ];

        if let Some(side) = status.side {
            lines.push(format!("Position: {} {}", side, status.size));
        }
        if let Some(price) = status.open_price {
            lines.push(format!("Open price: {}", price));
        }
        if let Some(price) = status.hedge_price {
            lines.push(format!("Hedge price: {}", price));
        }
        for (label, order) in [
            ("Bid order", &status.bid_order),
            ("Ask order", &status.ask_order),
            ("Close order", &status.close_order),
        ] {
            if let Some(id) = order {
                lines.push(format!("{}: {}", label, id));
            }
        }
        if let Some(until) = status.hold_until {
            lines.push(format!("Holding until {}", until.format("%H:%M:%S UTC")));
        }
        if let Some(until) = status.cooldown_until {
            lines.push(format!("Cooldown until {}", until.format("%H:%M:%S UTC")));
        }
        if let Some(summary) = &status.last_summary {
            lines.push(format!(
                "Last cycle: {} {} @ {} (${} volume)",
                summary.side,
                summary.size,
                summary.price,
                summary.volume_usd.round_dp(2)
            ));
        }

        lines.join("\n")
    }

    /// Per-venue collateral and session PnL for an operator.
    pub fn balance_report(&self) -> String {
        let Some(account) = self.status().account else {
            return "Balance not available yet".to_string();
        };

        let mut lines = Vec::new();
        for (label, balance, pnl) in [
            ("Maker", account.maker, account.maker_pnl),
            ("Taker", account.taker, account.taker_pnl),
        ] {
            lines.push(format!(
                "{}: equity ${}, collateral ${}, free ${}",
                label,
                balance.equity.round_dp(2),
                balance.collateral.round_dp(2),
                balance.free_collateral.round_dp(2)
            ));
            if let Some(pnl) = pnl {
                lines.push(format!("  PnL: ${}", pnl.round_dp(2)));
            }
        }
        if let Some(total) = account.total_pnl() {
            lines.push(format!("Session PnL: ${}", total.round_dp(2)));
        }
        lines.push(format!(
            "Updated {}",
            account.updated_at.format("%H:%M:%S UTC")
        ));

        lines.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Tunables;
    use rust_decimal_macros::dec;

    fn handle() -> ControlHandle {
        ControlHandle::new(ConfigHandle::new(Tunables::default()))
    }

    #[test]
    fn test_pause_resume_flags() {
        let control = handle();
        let remote = control.clone();
        assert!(control.is_enabled());

        remote.pause();
        assert!(!control.is_enabled());
        remote.resume();
        assert!(control.is_enabled());

        remote.request_shutdown();
        assert!(control.is_shutdown_requested());
    }

    #[tokio::test]
    async fn test_shutdown_wakes_waiters() {
        let control = handle();
        let waiter = control.clone();
        let task = tokio::spawn(async move { waiter.shutdown_requested().await });

        tokio::task::yield_now().await;
        control.request_shutdown();
        tokio::time::timeout(std::time::Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    fn test_configure_reaches_shared_tunables() {
        let control = handle();
        control.configure("LEVERAGE", &["25"]).unwrap();
        assert_eq!(control.config().snapshot().leverage, 25);
        assert!(control.configure("LEVERAGE", &["0"]).is_err());
    }

    #[test]
    fn test_summary_volume_counts_both_legs() {
        let summary = CycleSummary::new(Side::Bid, dec!(0.02), dec!(50000));
        assert_eq!(summary.volume_usd, dec!(2000));
    }

    #[tokio::test]
    async fn test_status_updates_are_observable() {
        let control = handle();
        let mut rx = control.subscribe();

        control.update_status(|s| {
            s.state = CycleState::Holding;
            s.side = Some(Side::Ask);
            s.size = dec!(0.02);
            s.close_order = Some(OrderId::from(7));
        });

        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().state, CycleState::Holding);

        let report = control.status_report();
        assert!(report.contains("State: HOLDING"));
        assert!(report.contains("Position: ASK 0.02"));
        assert!(report.contains("Close order: 7"));
    }

    #[test]
    fn test_balance_report_lists_both_venues() {
        let control = handle();
        assert_eq!(control.balance_report(), "Balance not available yet");

        let balance = |equity| Balance {
            collateral: equity,
            free_collateral: equity - dec!(100),
            equity,
        };
        control.update_status(|s| {
            s.account = Some(AccountSnapshot {
                maker: balance(dec!(1012.345)),
                taker: balance(dec!(985)),
                maker_pnl: Some(dec!(12.345)),
                taker_pnl: Some(dec!(-15)),
                updated_at: Utc::now(),
            });
        });

        let report = control.balance_report();
        assert!(report.contains("Maker: equity $1012.34"));
        assert!(report.contains("free $885"));
        assert!(report.contains("Taker: equity $985"));
        assert!(report.contains("PnL: $-15"));
        assert!(report.contains("Session PnL: $-2.66"));
    }

    #[test]
    fn test_in_cycle_states() {
        assert!(!CycleState::Idle.in_cycle());
        assert!(!CycleState::Paused.in_cycle());
        assert!(CycleState::Opening.in_cycle());
        assert!(CycleState::Cooldown.in_cycle());
    }
}
