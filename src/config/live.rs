//! Runtime-editable tunables.
//!
//! [`ConfigHandle`] is the single entry point for changing strategy
//! parameters while the bot runs. Every update is parsed, applied to a
//! candidate copy, validated as a whole and only then swapped in, so
//! readers never observe a half-applied value (e.g. a range with
//! min > max). Accepted values are persisted as JSON and re-applied on the
//! next start.

use super::{Bounds, Tunables};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;
use tracing::{error, info};

/// Editable setting identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Setting {
    OrderSize,
    Hold,
    Cooldown,
    OrderTimeout,
    Reprice,
    CloseBuffer,
    SpreadOffset,
    HedgeSlippage,
    Leverage,
    DryRun,
}

struct SettingMeta {
    setting: Setting,
    key: &'static str,
    arity: usize,
    desc: &'static str,
    example: &'static str,
}

const SETTINGS: &[SettingMeta] = &[
    SettingMeta {
        setting: Setting::OrderSize,
        key: "ORDER_SIZE_USD",
        arity: 2,
        desc: "Order size range in USD (min max)",
        example: "SIZE 800 1200",
    },
    SettingMeta {
        setting: Setting::Hold,
        key: "HOLD_MINUTES",
        arity: 2,
        desc: "Hold duration range in minutes (min max)",
        example: "HOLD 30 60",
    },
    SettingMeta {
        setting: Setting::Cooldown,
        key: "COOLDOWN_MINUTES",
        arity: 2,
        desc: "Cooldown range in minutes (min max)",
        example: "COOLDOWN 10 15",
    },
    SettingMeta {
        setting: Setting::OrderTimeout,
        key: "ORDER_TIMEOUT_SECS",
        arity: 1,
        desc: "Cancel unfilled opening order after N seconds",
        example: "TIMEOUT 300",
    },
    SettingMeta {
        setting: Setting::Reprice,
        key: "REPRICE_SECS",
        arity: 1,
        desc: "Re-quote resting orders every N seconds",
        example: "REPRICE 30",
    },
    SettingMeta {
        setting: Setting::CloseBuffer,
        key: "CLOSE_BUFFER_USD",
        arity: 1,
        desc: "Close order distance from maker BBO (USD)",
        example: "BUFFER 15",
    },
    SettingMeta {
        setting: Setting::SpreadOffset,
        key: "SPREAD_OFFSET_BPS",
        arity: 1,
        desc: "Opening quote offset from taker mid (bps)",
        example: "SPREAD 10",
    },
    SettingMeta {
        setting: Setting::HedgeSlippage,
        key: "HEDGE_SLIPPAGE_BPS",
        arity: 1,
        desc: "Max hedge slippage (bps)",
        example: "SLIPPAGE 10",
    },
    SettingMeta {
        setting: Setting::Leverage,
        key: "LEVERAGE",
        arity: 1,
        desc: "Leverage for margin and liquidation estimates",
        example: "LEVERAGE 40",
    },
    SettingMeta {
        setting: Setting::DryRun,
        key: "DRY_RUN",
        arity: 1,
        desc: "Simulate orders without sending",
        example: "DRY_RUN true",
    },
];

const ALIASES: &[(&str, &str)] = &[
    ("SIZE", "ORDER_SIZE_USD"),
    ("ORDER_SIZE", "ORDER_SIZE_USD"),
    ("HOLD", "HOLD_MINUTES"),
    ("COOLDOWN", "COOLDOWN_MINUTES"),
    ("TIMEOUT", "ORDER_TIMEOUT_SECS"),
    ("REPRICE", "REPRICE_SECS"),
    ("BUFFER", "CLOSE_BUFFER_USD"),
    ("SPREAD", "SPREAD_OFFSET_BPS"),
    ("SLIPPAGE", "HEDGE_SLIPPAGE_BPS"),
];

/// Reasons a live update is refused. The running value is untouched.
#[derive(Debug, Error, PartialEq)]
pub enum SettingError {
    #[error("unknown setting `{0}`")]
    Unknown(String),
    #[error("`{key}` expects {expected} value(s), e.g. `{example}`")]
    Arity {
        key: &'static str,
        expected: usize,
        example: &'static str,
    },
    #[error("invalid value `{value}` for `{key}`")]
    Parse { key: &'static str, value: String },
    #[error("`{key}` rejected: {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// Record of an accepted update.
#[derive(Debug, Clone, PartialEq)]
pub struct SettingChange {
    pub key: &'static str,
    pub old: String,
    pub new: String,
}

/// Shared, validated handle to the live tunables.
#[derive(Debug, Clone)]
pub struct ConfigHandle {
    inner: Arc<RwLock<Tunables>>,
    overrides_path: Option<PathBuf>,
}

impl ConfigHandle {
    /// Create an in-memory handle (no persistence).
    pub fn new(tunables: Tunables) -> Self {
        Self {
            inner: Arc::new(RwLock::new(tunables)),
            overrides_path: None,
        }
    }

    /// Create a handle that persists accepted updates to `path`.
    pub fn with_persistence(tunables: Tunables, path: impl Into<PathBuf>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(tunables)),
            overrides_path: Some(path.into()),
        }
    }

    /// Consistent copy of every tunable.
    pub fn snapshot(&self) -> Tunables {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn dry_run(&self) -> bool {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .dry_run
    }

    /// Apply one update. `key` is case-insensitive and may be an alias.
    pub fn set(&self, key: &str, values: &[&str]) -> Result<SettingChange, SettingError> {
        let meta = resolve(key)?;

        if values.len() != meta.arity {
            return Err(SettingError::Arity {
                key: meta.key,
                expected: meta.arity,
                example: meta.example,
            });
        }

        let change = {
            let mut guard = self.inner.write().unwrap_or_else(PoisonError::into_inner);
            let mut candidate = guard.clone();
            apply(meta, &mut candidate, values)?;
            candidate.validate().map_err(|e| SettingError::Invalid {
                key: meta.key,
                reason: e.to_string(),
            })?;

            let change = SettingChange {
                key: meta.key,
                old: render(meta.setting, &guard),
                new: render(meta.setting, &candidate),
            };
            *guard = candidate;
            change
        };

        info!(
            key = change.key,
            old = %change.old,
            new = %change.new,
            "Live setting updated"
        );
        self.persist();

        Ok(change)
    }

    /// Replace all tunables at once after validation.
    pub fn replace(&self, tunables: Tunables) -> anyhow::Result<()> {
        tunables.validate()?;
        *self.inner.write().unwrap_or_else(PoisonError::into_inner) = tunables;
        Ok(())
    }

    /// Re-apply overrides persisted by a previous run. Returns whether a
    /// file was found and applied.
    pub fn load_overrides(&self) -> anyhow::Result<bool> {
        let Some(path) = self.overrides_path.as_deref() else {
            return Ok(false);
        };
        if !path.exists() {
            return Ok(false);
        }

        let raw = std::fs::read_to_string(path)?;
        let tunables: Tunables = serde_json::from_str(&raw)?;
        self.replace(tunables)?;
        info!(path = %path.display(), "Loaded config overrides");
        Ok(true)
    }

    fn persist(&self) {
        let Some(path) = self.overrides_path.as_deref() else {
            return;
        };
        if let Err(e) = write_overrides(path, &self.snapshot()) {
            error!(path = %path.display(), error = %e, "Failed to save config overrides");
        }
    }

    /// Current settings, one per line, with their short alias.
    pub fn settings_display(&self) -> String {
        let tunables = self.snapshot();
        SETTINGS
            .iter()
            .map(|meta| {
                format!(
                    "{}: {}\n   {}\n   Example: {}",
                    short_name(meta.key),
                    render(meta.setting, &tunables),
                    meta.desc,
                    meta.example
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Usage text listing every editable setting and its aliases.
    pub fn help_text() -> String {
        SETTINGS
            .iter()
            .map(|meta| {
                let aliases: Vec<&str> = ALIASES
                    .iter()
                    .filter(|(_, target)| *target == meta.key)
                    .map(|(alias, _)| *alias)
                    .collect();
                if aliases.is_empty() {
                    format!("{} - {}", meta.key, meta.desc)
                } else {
                    format!("{} ({}) - {}", meta.key, aliases.join(", "), meta.desc)
                }
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

fn write_overrides(path: &Path, tunables: &Tunables) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(tunables)?;
    std::fs::write(path, json)?;
    Ok(())
}

fn resolve(key: &str) -> Result<&'static SettingMeta, SettingError> {
    let upper = key.trim().to_ascii_uppercase();
    let canonical = ALIASES
        .iter()
        .find(|(alias, _)| *alias == upper)
        .map(|(_, target)| *target)
        .unwrap_or(upper.as_str());

    SETTINGS
        .iter()
        .find(|meta| meta.key == canonical)
        .ok_or_else(|| SettingError::Unknown(upper.clone()))
}

fn short_name(key: &'static str) -> &'static str {
    ALIASES
        .iter()
        .filter(|(_, target)| *target == key)
        .map(|(alias, _)| *alias)
        .min_by_key(|alias| alias.len())
        .unwrap_or(key)
}

fn apply(meta: &SettingMeta, t: &mut Tunables, values: &[&str]) -> Result<(), SettingError> {
    let key = meta.key;
    match meta.setting {
        Setting::OrderSize => {
            t.order_size_usd = Bounds::new(decimal(key, values[0])?, decimal(key, values[1])?);
        }
        Setting::Hold => {
            t.hold_secs = Bounds::new(minutes(key, values[0])?, minutes(key, values[1])?);
        }
        Setting::Cooldown => {
            t.cooldown_secs = Bounds::new(minutes(key, values[0])?, minutes(key, values[1])?);
        }
        Setting::OrderTimeout => t.order_timeout_secs = seconds(key, values[0])?,
        Setting::Reprice => t.reprice_interval_secs = seconds(key, values[0])?,
        Setting::CloseBuffer => t.close_buffer_usd = decimal(key, values[0])?,
        Setting::SpreadOffset => t.spread_offset_bps = decimal(key, values[0])?,
        Setting::HedgeSlippage => t.hedge_slippage_bps = integer(key, values[0])?,
        Setting::Leverage => t.leverage = integer(key, values[0])?,
        Setting::DryRun => {
            t.dry_run = matches!(
                values[0].to_ascii_lowercase().as_str(),
                "true" | "1" | "yes" | "on"
            )
        }
    }
    Ok(())
}

fn render(setting: Setting, t: &Tunables) -> String {
    match setting {
        Setting::OrderSize => format!("{}-{}", t.order_size_usd.min, t.order_size_usd.max),
        Setting::Hold => format!("{}-{} min", t.hold_secs.min / 60, t.hold_secs.max / 60),
        Setting::Cooldown => format!(
            "{}-{} min",
            t.cooldown_secs.min / 60,
            t.cooldown_secs.max / 60
        ),
        Setting::OrderTimeout => format!("{}s", t.order_timeout_secs),
        Setting::Reprice => format!("{}s", t.reprice_interval_secs),
        Setting::CloseBuffer => t.close_buffer_usd.to_string(),
        Setting::SpreadOffset => t.spread_offset_bps.to_string(),
        Setting::HedgeSlippage => t.hedge_slippage_bps.to_string(),
        Setting::Leverage => t.leverage.to_string(),
        Setting::DryRun => t.dry_run.to_string(),
    }
}

fn decimal(key: &'static str, raw: &str) -> Result<Decimal, SettingError> {
    raw.trim().parse::<Decimal>().map_err(|_| SettingError::Parse {
        key,
        value: raw.to_string(),
    })
}

fn minutes(key: &'static str, raw: &str) -> Result<u64, SettingError> {
    let value = decimal(key, raw)?;
    (value * Decimal::from(60))
        .round()
        .to_u64()
        .ok_or(SettingError::Parse {
            key,
            value: raw.to_string(),
        })
}

fn seconds(key: &'static str, raw: &str) -> Result<u64, SettingError> {
    decimal(key, raw)?.round().to_u64().ok_or(SettingError::Parse {
        key,
        value: raw.to_string(),
    })
}

fn integer(key: &'static str, raw: &str) -> Result<u32, SettingError> {
    raw.trim().parse::<u32>().map_err(|_| SettingError::Parse {
        key,
        value: raw.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_alias_and_minutes_conversion() {
        let handle = ConfigHandle::new(Tunables::default());

        let change = handle.set("hold", &["30", "60"]).unwrap();
        assert_eq!(change.key, "HOLD_MINUTES");
        assert_eq!(handle.snapshot().hold_secs, Bounds::new(1800, 3600));

        handle.set("Cooldown", &["1.5", "2"]).unwrap();
        assert_eq!(handle.snapshot().cooldown_secs, Bounds::new(90, 120));
    }

    #[test]
    fn test_inverted_range_is_rejected_atomically() {
        let handle = ConfigHandle::new(Tunables::default());
        let before = handle.snapshot();

        let err = handle.set("SIZE", &["1500", "900"]).unwrap_err();
        assert!(matches!(err, SettingError::Invalid { key: "ORDER_SIZE_USD", .. }));
        assert_eq!(handle.snapshot(), before);
    }

    #[test]
    fn test_arity_and_parse_errors() {
        let handle = ConfigHandle::new(Tunables::default());

        assert!(matches!(
            handle.set("SIZE", &["1000"]),
            Err(SettingError::Arity { expected: 2, .. })
        ));
        assert!(matches!(
            handle.set("LEVERAGE", &["forty"]),
            Err(SettingError::Parse { key: "LEVERAGE", .. })
        ));
        assert_eq!(
            handle.set("NOPE", &["1"]),
            Err(SettingError::Unknown("NOPE".to_string()))
        );
    }

    #[test]
    fn test_scalar_updates() {
        let handle = ConfigHandle::new(Tunables::default());

        tokio_test::assert_ok!(handle.set("BUFFER", &["15.5"]));
        tokio_test::assert_ok!(handle.set("SLIPPAGE", &["12"]));
        tokio_test::assert_ok!(handle.set("DRY_RUN", &["yes"]));

        let t = handle.snapshot();
        assert_eq!(t.close_buffer_usd, dec!(15.5));
        assert_eq!(t.hedge_slippage_bps, 12);
        assert!(handle.dry_run());
    }

    #[test]
    fn test_clones_share_state() {
        let handle = ConfigHandle::new(Tunables::default());
        let reader = handle.clone();

        handle.set("LEVERAGE", &["20"]).unwrap();
        assert_eq!(reader.snapshot().leverage, 20);
    }

    #[test]
    fn test_overrides_persist_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("overrides.json");

        let handle = ConfigHandle::with_persistence(Tunables::default(), &path);
        handle.set("SPREAD", &["7"]).unwrap();
        assert!(path.exists());

        let restored = ConfigHandle::with_persistence(Tunables::default(), &path);
        assert!(restored.load_overrides().unwrap());
        assert_eq!(restored.snapshot().spread_offset_bps, dec!(7));
    }

    #[test]
    fn test_display_uses_short_aliases() {
        let handle = ConfigHandle::new(Tunables::default());
        let display = handle.settings_display();
        assert!(display.contains("SIZE: 1000-1300"));
        assert!(display.contains("HOLD: 10-15 min"));
        assert!(ConfigHandle::help_text().contains("HOLD_MINUTES (HOLD)"));
    }
}
