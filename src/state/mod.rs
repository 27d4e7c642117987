//! State module for tracking harvest progress
//!
//! # Components
//!
//! - `ProductStatus`: Classification stored with each persisted product
//! - `BlockState`: Per-retailer sliding-window block statistics
//! - `FetchMode`: Direct or proxied request routing

mod block_state;
mod product_status;

// Re-export main types
pub use block_state::{BlockState, FetchMode};
pub use product_status::ProductStatus;
