//! Fleet Node -- library crate for the cluster node process.
//!
//! Exposes the node's components so the binary, the integration tests and
//! managed service processes (through `wrapper`) share one implementation.

pub mod auth;
pub mod config;
pub mod context;
pub mod data;
pub mod identity;
pub mod internal;
pub mod messenger;
pub mod node;
pub mod services;
pub mod template_deploy;
pub mod tick;
pub mod wrapper;

use std::path::PathBuf;

pub use context::{ChannelOwner, NodeContext};
pub use node::RunningNode;

pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs_or_home() {
            return home.join(stripped);
        }
    }
    PathBuf::from(path)
}

pub fn dirs_or_home() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}

/// Random alphanumeric secret a service presents when it connects.
pub fn generate_secret() -> String {
    use rand::Rng;
    rand::thread_rng()
        .sample_iter(&rand::distributions::Alphanumeric)
        .take(48)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_tilde_leaves_absolute_paths() {
        assert_eq!(expand_tilde("/etc/fleet"), PathBuf::from("/etc/fleet"));
        if let Some(home) = dirs_or_home() {
            assert_eq!(expand_tilde("~/x"), home.join("x"));
        }
    }

    #[test]
    fn test_generate_secret() {
        let a = generate_secret();
        let b = generate_secret();
        assert_eq!(a.len(), 48);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(a, b);
    }
}
