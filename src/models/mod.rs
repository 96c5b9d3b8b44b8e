//! Domain models for the PitchDesk backend.
//!
//! Opportunities carry a moving price; every change lands in the append-only
//! price ledger. Drafts and pitches record one user's relationship with one
//! opportunity.

pub mod draft;
pub mod opportunity;
pub mod pitch;
pub mod price_point;

// Re-export all models for convenient access
pub use draft::Draft;
pub use opportunity::{NewOpportunity, Opportunity, OpportunityStatus};
pub use pitch::{DemandStats, Pitch, PitchStatus};
pub use price_point::{ledger_time, PricePoint, PriceTrend};
