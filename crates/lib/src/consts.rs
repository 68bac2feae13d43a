/// Application name, used for data and cache directories.
pub const APP_NAME: &str = "strata";

/// Length of the truncated hash used for layer keys.
pub const OBJ_HASH_PREFIX_LEN: usize = 20;

/// Working directory of a fresh environment.
pub const DEFAULT_WORKING_DIR: &str = "/";

/// Base image reference that denotes an empty filesystem.
pub const SCRATCH_IMAGE: &str = "scratch";

/// Format version of `layer.json` records.
pub const LAYER_RECORD_VERSION: u32 = 1;
