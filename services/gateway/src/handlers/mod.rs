pub mod bars;
pub mod stream;
