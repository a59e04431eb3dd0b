//! Three-stage opportunity discovery: a broad screener scan, a zero-call
//! strategic filter under the current market regime, and a budgeted deep
//! dive that attaches technical analysis to the survivors.

mod funnel;
pub mod indicators;
mod models;
pub mod scoring;

pub use funnel::{
    merge_candidates, passes_hard_filters, reorder_with_oracle, FunnelConfig, OpportunityFunnel,
};
pub use models::{DeepAnalysis, DiscoverySource, FunnelStats, MarketCapBucket, Opportunity};
