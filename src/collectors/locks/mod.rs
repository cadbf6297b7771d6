pub mod count;
pub mod extended;
