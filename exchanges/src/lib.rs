pub mod mock;
pub mod paper;

pub use mock::{FillScript, MockExchange, MockState};
pub use paper::PaperPriceDriver;
