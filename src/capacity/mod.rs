//! Capacity router: token and request budgets per provider ("virtual key").
//!
//! Every outgoing call must hold a [`Permit`] from [`CapacityRouter::admit`].

mod router;
mod window;

pub use router::{
    Admission, BudgetUtilization, CapacityRouter, Permit, ProviderBudget, RejectReason,
    CONCURRENCY_RETRY_HINT,
};
pub use window::SlidingWindow;
