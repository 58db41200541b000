pub mod client;
pub mod session;

pub use client::{FeedDoc, GetOutcome, StoreClient, UpdateDoc};
pub use session::DeploymentSession;
