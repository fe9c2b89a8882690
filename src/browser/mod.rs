pub mod remote;

pub use remote::{BrowserServiceResponse, RemoteBrowserService};
