pub mod ingestion;
pub mod processing;

pub use ingestion::{MarketDataSource, PolygonClient};
pub use processing::{convert_to_four_hour_candles, FourHourCandle, SessionPeriod};
