// =============================================================================
// Market data — candle storage and the trade ingest path
// =============================================================================

pub mod candle_series;
pub mod interpreter;
pub mod trade_queue;

pub use candle_series::{CandleRow, CandleSeries, SeriesSet, SERIES_CAPACITY};
pub use interpreter::TradeInterpreter;
pub use trade_queue::{TradeQueue, TRADE_QUEUE_CAPACITY};
