pub mod opportunity_service;
pub mod pitch_service;
pub mod price_engine;
pub mod query_service;

pub use opportunity_service::OpportunityService;
pub use pitch_service::{AutosaveQueue, PitchService, SubmissionReceipt, UserPitchStatus};
pub use price_engine::{EngineHandle, PriceEngine, TickReport};
pub use query_service::{
    BidInfo, CurrentPrice, PriceTrendView, PriceWindow, QueryService, RelatedOpportunity,
};
