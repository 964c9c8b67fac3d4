use const_format::formatcp;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");

pub const USER_AGENT: &str = formatcp!("{}/{}", NAME, VERSION);
