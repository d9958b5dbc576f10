//! Composable operations over the storage primitives: navigation, diffing,
//! merge/rebase/cherry-pick, history compression, and the generic retry
//! controller. Operations never own a transaction; the facade wraps each
//! call and rolls back on error.

pub mod compress;
pub mod diff;
pub mod merge;
pub mod navigate;
pub mod rebase;
pub mod retry;
