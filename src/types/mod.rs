pub mod candle;
pub mod market;
pub mod progress;

pub use candle::*;
pub use market::*;
pub use progress::*;
