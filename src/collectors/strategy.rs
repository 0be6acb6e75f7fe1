use std::fmt::Display;
use tracing::warn;

/// One-way state machine for collectors with an optional accelerated path.
///
/// A collector starts in `Accelerated` holding the library handle and drops
/// to `Native` on the first library failure. There is no way back.
pub enum Strategy<L> {
    Accelerated(L),
    Native,
}

impl<L> Strategy<L> {
    pub fn library_mut(&mut self) -> Option<&mut L> {
        match self {
            Strategy::Accelerated(lib) => Some(lib),
            Strategy::Native => None,
        }
    }

    /// Switches to the native strategy, logging only on the actual transition.
    pub fn degrade(&mut self, collector: &'static str, reason: &dyn Display) {
        if let Strategy::Accelerated(_) = self {
            warn!(
                collector,
                reason = %reason,
                "accelerated sampling failed, switching to native strategy"
            );
            *self = Strategy::Native;
        }
    }

    pub fn label(&self, accelerated: &'static str, native: &'static str) -> &'static str {
        match self {
            Strategy::Accelerated(_) => accelerated,
            Strategy::Native => native,
        }
    }
}
