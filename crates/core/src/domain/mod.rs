pub mod records;
pub mod shortlist;
pub mod snapshot;
