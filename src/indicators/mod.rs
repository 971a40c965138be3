// =============================================================================
// Indicator kernels
// =============================================================================
//
// Pure, side-effect-free numerical routines over dense `f64` buffers. Every
// kernel is deterministic bit-for-bit for a given input on a given platform
// and allocates at most scratch space proportional to the input length.
// Callers are forced to handle the insufficient-data case through `Result`.

pub mod atr;
pub mod ema;
pub mod hma;
pub mod macd;
pub mod rsi;
pub mod sma;

pub use atr::atr;
pub use ema::ema;
pub use hma::{hma, wma};
pub use macd::macd;
pub use rsi::rsi;
pub use sma::{regression_slope, slope_segments, sma, SlopeSegment};
