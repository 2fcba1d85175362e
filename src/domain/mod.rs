pub mod classifier;
pub mod node;
pub mod reconciler;
