pub mod broadcast;
pub mod feed;
pub mod pool;
pub mod settlement;
pub mod sweeper;
pub mod tracker;
pub mod transitions;
