pub use merger::{InputPolicy, Merger, MergerPolicy, OutputPolicy};

pub mod merger;
