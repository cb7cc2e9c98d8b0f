pub mod call;
pub mod cel;
pub mod direction;
pub mod event;
pub mod metrics;
pub mod reconcile;
pub mod store;
