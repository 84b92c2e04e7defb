pub mod reconciler;

pub use reconciler::{CoreError, CoreResult, Eligibility, IneligibleReason, ReconcilePolicy, Reconciler};
