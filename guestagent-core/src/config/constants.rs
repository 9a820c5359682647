// Guest Agent Configuration Constants

use std::time::Duration;

/// WireServer endpoint for communicating with the platform host
pub const WIRESERVER_ENDPOINT: &str = "http://168.63.129.16";

/// Agent name
pub const AGENT_NAME: &str = "guestagent-rs";

/// Agent version string
pub const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// API version for the WireServer protocol (goal state, extensions config)
pub const WIRESERVER_API_VERSION: &str = "2012-11-30";

/// API version for the status upload endpoint
pub const STATUS_API_VERSION: &str = "2015-09-01";

/// Interval between goal state polls
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);

/// Interval between status uploads
pub const DEFAULT_STATUS_INTERVAL: Duration = Duration::from_secs(30);

/// Interval between auto-update checks
pub const DEFAULT_UPDATE_INTERVAL: Duration = Duration::from_secs(3600);

/// Hard floor on the update check interval; configuration cannot go below this
pub const UPDATE_INTERVAL_FLOOR: Duration = Duration::from_secs(600);

/// Maximum concurrent extension operations within one dependency level
pub const DEFAULT_CONCURRENCY_LIMIT: usize = 3;

/// Wall-clock timeout for a single extension lifecycle command
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(900);

/// A handler that has not touched its status file within this window is hung
pub const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(300);

/// Timeout for individual HTTP requests to the WireServer
pub const HTTP_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout for package downloads (extension and agent packages)
pub const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(60);

/// Attempts per fetch before deferring to the next poll cycle
pub const MAX_FETCH_ATTEMPTS: u32 = 4;

/// Initial backoff delay for transient fetch failures
pub const FETCH_BACKOFF_BASE: Duration = Duration::from_secs(1);

/// Backoff delay cap for transient fetch failures
pub const FETCH_BACKOFF_CAP: Duration = Duration::from_secs(32);

/// Attempts per status upload before falling back to the cached baseline
pub const MAX_UPLOAD_ATTEMPTS: u32 = 3;

/// Agent state directory
pub const DEFAULT_LIB_DIR: &str = "/var/lib/guestagent-rs";

/// cgroup v2 hierarchy root used by the resource governor
pub const DEFAULT_CGROUP_ROOT: &str = "/sys/fs/cgroup";

/// Slice name grouping agent and extension cgroups
pub const CGROUP_SLICE: &str = "guestagent.slice";
