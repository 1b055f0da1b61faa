pub mod compute;
pub mod core;
pub mod gradebook;
pub mod mastery;
pub mod roster;
pub mod schedule;
pub mod schemes;
