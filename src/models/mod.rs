pub mod candidate;
pub mod dispatch;
pub mod driver;
pub mod order;
