/// Stack limit applied in the child between fork and exec
///
/// Only RLIMIT_STACK is touched. Heap and address-space limits are never set because
/// scoring code commonly loads large numeric libraries.
use nix::sys::resource::{getrlimit, setrlimit, Resource, RLIM_INFINITY};
use std::os::unix::process::CommandExt;
use std::process::Command;

/// Whether a stack limit can be applied from this process
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StackLimitSupport {
    /// Applicable; `hard` is the hard limit the child will keep
    Supported { hard: u64 },
    Unsupported(String),
}

impl StackLimitSupport {
    pub fn is_supported(&self) -> bool {
        matches!(self, StackLimitSupport::Supported { .. })
    }
}

/// Check that `requested` bytes fits under the current hard stack limit
pub fn stack_limit_support(requested: u64) -> StackLimitSupport {
    match getrlimit(Resource::RLIMIT_STACK) {
        Ok((_soft, hard)) => {
            if hard != RLIM_INFINITY && requested > hard {
                StackLimitSupport::Unsupported(format!(
                    "requested {} bytes exceeds hard RLIMIT_STACK {}",
                    requested, hard
                ))
            } else {
                StackLimitSupport::Supported { hard }
            }
        }
        Err(e) => StackLimitSupport::Unsupported(format!("getrlimit(RLIMIT_STACK) failed: {}", e)),
    }
}

/// Install a pre-exec hook setting the soft stack limit to `bytes`, keeping `hard`.
pub fn install_stack_limit(command: &mut Command, bytes: u64, hard: u64) {
    // Only async-signal-safe work happens between fork and exec: one setrlimit call.
    unsafe {
        command.pre_exec(move || {
            setrlimit(Resource::RLIMIT_STACK, bytes, hard).map_err(std::io::Error::from)
        });
    }
}
