//! Shared fixtures for strategy tests.

use super::CycleFarmer;
use crate::alert::{AlertSink, LogAlertSink};
use crate::config::{Bounds, Config, ConfigHandle};
use crate::control::ControlHandle;
use crate::exchange::{MockMakerVenue, MockMarket, MockTakerVenue};
use rust_decimal_macros::dec;
use std::sync::Arc;

pub(crate) struct Harness {
    pub farmer: CycleFarmer,
    pub maker: Arc<MockMakerVenue>,
    pub taker: Arc<MockTakerVenue>,
    pub market: MockMarket,
    pub control: ControlHandle,
}

/// 1000 USD cycles, one-minute holds and no cooldown.
pub(crate) fn test_config() -> Config {
    let mut config = Config::default();
    config.tunables.order_size_usd = Bounds::new(dec!(1000), dec!(1000));
    config.tunables.hold_secs = Bounds::new(60, 60);
    config.tunables.cooldown_secs = Bounds::new(0, 0);
    config
}

pub(crate) fn harness(config: Config) -> Harness {
    harness_with_alerts(config, Arc::new(LogAlertSink))
}

/// Farmer wired to mock venues around a 50,000 mid with a 10 USD spread.
pub(crate) fn harness_with_alerts(config: Config, alerts: Arc<dyn AlertSink>) -> Harness {
    let market = MockMarket::new(dec!(50000), dec!(10));
    let maker = Arc::new(MockMakerVenue::new(market.clone()));
    let taker = Arc::new(MockTakerVenue::new(market.clone()));
    let control = ControlHandle::new(ConfigHandle::new(config.tunables.clone()));

    let farmer = CycleFarmer::new(
        config,
        maker.clone(),
        taker.clone(),
        alerts,
        control.clone(),
    );

    Harness {
        farmer,
        maker,
        taker,
        market,
        control,
    }
}
