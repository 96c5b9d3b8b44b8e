pub mod history;
pub mod model;

pub use model::{PriceInputs, PricingError, PricingModel, PricingResult};
