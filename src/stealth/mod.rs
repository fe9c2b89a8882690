pub mod fingerprint;
pub mod headers;
pub mod session;
pub mod user_agents;

pub use fingerprint::{Fingerprint, FingerprintGenerator};
pub use headers::HeaderGenerator;
pub use session::{Session, SessionHealth, SessionPool, SessionPoolStats};
pub use user_agents::UserAgentPool;
