//! Shared types for Gatehouse

mod error;
mod governance;

pub use error::{GatehouseError, Result};
pub use governance::{
    FetcherStatus, KeyStatus, OwnerType, PromotionStatus, TrustLevel, Visibility,
};
