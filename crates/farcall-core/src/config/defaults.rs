/// Default host the server binds and the proxy connects to
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Default server port
pub const DEFAULT_PORT: u16 = 9000;

/// Name of the server executable looked up on `PATH`
pub const SERVER_BINARY: &str = "farcall";

/// Connection attempts after spawning a server
pub const DEFAULT_CONNECT_ATTEMPTS: u32 = 20;

/// Delay between connection attempts (milliseconds)
pub const DEFAULT_CONNECT_DELAY_MS: u64 = 200;

/// Attempts made by the call retry wrapper
pub const DEFAULT_CALL_ATTEMPTS: u32 = 5;

/// Wait between call retries (milliseconds)
pub const DEFAULT_CALL_RETRY_WAIT_MS: u64 = 500;

/// Pause between shutting a server down and spawning its replacement (milliseconds)
pub const DEFAULT_RESTART_DELAY_MS: u64 = 1000;

/// How long a spawned server gets to exit after shutdown before it is killed (milliseconds)
pub const DEFAULT_STOP_GRACE_MS: u64 = 2000;
