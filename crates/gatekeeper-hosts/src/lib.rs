pub mod bitbucket;
pub mod github;
pub mod jira;
pub mod mock;

pub use mock::{MockHost, MockIssueTracker};
