//! A global store of flags that can impact slicing and evaluation.
//!
//! WARNING: Currently only supports a single consistent configuration amongst threads (i.e., cannot
//! have different configurations for different analyses in the same process). Per-request inputs,
//! such as the symbolic stack-read table or initial register values, are passed explicitly instead.

/// The global configuration store. Its fields are expected to be accessed across the program via
/// the global [`CONFIG`](static@CONFIG).
pub struct AnalysisConfig {
    /// Treat a write to a sub-register as also depending on the previous version of its full
    /// register, since the bits outside the sub-register are carried over from it. Without this,
    /// slices of partial writes can be missing the definitions needed to evaluate them.
    pub track_previous_version_of_partial_writes: bool,
    /// Remember the value of each register version once it has been evaluated, so that shared
    /// sub-expressions of a slice are only computed once.
    pub memoize_register_values: bool,
    /// Log every step of the backward slice traversal (at `trace` level).
    pub debug_log_slice_traversal: bool,
}

impl AnalysisConfig {
    /// Internal method: sets up initialization
    #[allow(static_mut_refs)]
    fn from_initialized() -> Self {
        let init = unsafe { INTERNAL_CONFIG_INITIALIZER.take() };
        init.flatten().unwrap_or_default()
    }

    /// Initialize with the given command line configuration. Should only be called once, and should
    /// only be called from `main`. Library users and tests that never call this get the defaults.
    #[allow(static_mut_refs)]
    pub fn initialize(command_line_config: Vec<CommandLineAnalysisConfig>) {
        let prev = unsafe { INTERNAL_CONFIG_INITIALIZER.replace(Some(command_line_config.into())) };
        assert!(prev.is_some(), "Performed double initialization");
        lazy_static::initialize(&CONFIG);
    }
}

/// Internal initialization detail.
static mut INTERNAL_CONFIG_INITIALIZER: Option<Option<AnalysisConfig>> = Some(None);

lazy_static::lazy_static! {
    /// The global configuration store
    pub static ref CONFIG: AnalysisConfig = AnalysisConfig::from_initialized();
}

#[derive(clap::ArgEnum, Clone, Debug)]
/// Analysis configuration parameters
pub enum CommandLineAnalysisConfig {
    DisablePreviousVersionTrackingForPartialWrites,
    DisableRegisterMemoization,
    EnableDebugLogSliceTraversal,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        AnalysisConfig {
            track_previous_version_of_partial_writes: true,
            memoize_register_values: true,
            debug_log_slice_traversal: false,
        }
    }
}

impl From<Vec<CommandLineAnalysisConfig>> for AnalysisConfig {
    fn from(v: Vec<CommandLineAnalysisConfig>) -> Self {
        use CommandLineAnalysisConfig::*;
        let mut r = AnalysisConfig::default();
        for v in v {
            match v {
                DisablePreviousVersionTrackingForPartialWrites => {
                    r.track_previous_version_of_partial_writes = false;
                }
                DisableRegisterMemoization => {
                    r.memoize_register_values = false;
                }
                EnableDebugLogSliceTraversal => {
                    r.debug_log_slice_traversal = true;
                }
            }
        }
        r
    }
}
