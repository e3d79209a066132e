//! Extensions shipped with Courier.

pub mod retry;
