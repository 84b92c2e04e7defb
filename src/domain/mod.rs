pub mod order_reference;
pub mod transaction;

pub use order_reference::{OrderReference, OrderReferenceError};
pub use transaction::{
    is_whole_major, CancelReason, NewTransaction, Provider, Transaction, TransactionState,
    MAX_PROVIDER_REFERENCE_LEN, MINOR_PER_MAJOR,
};
