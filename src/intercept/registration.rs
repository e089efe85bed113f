//! Driver wrapper registration
//!
//! The one platform-specific surface: the host's bootstrap registers
//! a wrap function per driver URL scheme, and hands every new
//! physical connection through `wrap`. Unregistered schemes pass
//! through untouched.

use dashmap::DashMap;
use std::sync::Arc;
use tracing::info;

use super::traits::DriverConnection;

pub type BoxedDriverConnection = Box<dyn DriverConnection>;

/// Wrap function: original connection in, observed connection out.
pub type WrapFn = Arc<dyn Fn(BoxedDriverConnection) -> BoxedDriverConnection + Send + Sync>;

#[derive(Default)]
pub struct WrapperRegistry {
    wrappers: DashMap<String, WrapFn>,
}

impl WrapperRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, scheme: &str, wrap: WrapFn) {
        let scheme = scheme.to_ascii_lowercase();
        info!("Registered connection wrapper for scheme {}", scheme);
        self.wrappers.insert(scheme, wrap);
    }

    pub fn is_registered(&self, scheme: &str) -> bool {
        self.wrappers.contains_key(&scheme.to_ascii_lowercase())
    }

    /// Apply the scheme's wrap function, or pass through when none is
    /// registered.
    pub fn wrap(&self, scheme: &str, conn: BoxedDriverConnection) -> BoxedDriverConnection {
        match self.wrappers.get(&scheme.to_ascii_lowercase()) {
            Some(wrap) => (wrap)(conn),
            None => conn,
        }
    }
}
