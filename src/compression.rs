//! Per message compression policy.
//!
//! Whether a message is compressed is decided in three layers:
//! compression has to be enabled for the rpc as a whole, after which
//! the per-message [`CompressionOverride`] wins over the per-call default.

/// Per message override of the call's default compression.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum CompressionOverride {
    /// Use the default of the call.
    #[default]
    Inherit,
    /// Compress this message.
    Enable,
    /// Do not compress this message.
    Disable,
}

impl CompressionOverride {
    /// Resolve the override against the default of the call.
    #[must_use]
    pub const fn resolve(self, call_default: bool) -> bool {
        match self {
            Self::Inherit => call_default,
            Self::Enable => true,
            Self::Disable => false,
        }
    }
}

impl From<bool> for CompressionOverride {
    fn from(compress: bool) -> Self {
        if compress { Self::Enable } else { Self::Disable }
    }
}

/// Effective compress flag of a single outbound message.
#[must_use]
pub(crate) const fn should_compress(
    enabled_for_rpc: bool,
    message: CompressionOverride,
    call_default: bool,
) -> bool {
    enabled_for_rpc && message.resolve(call_default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn override_resolution() {
        assert!(CompressionOverride::Inherit.resolve(true));
        assert!(!CompressionOverride::Inherit.resolve(false));
        assert!(CompressionOverride::Enable.resolve(false));
        assert!(!CompressionOverride::Disable.resolve(true));
        assert_eq!(CompressionOverride::from(true), CompressionOverride::Enable);
    }

    #[test]
    fn disabled_rpc_never_compresses() {
        for message in [
            CompressionOverride::Inherit,
            CompressionOverride::Enable,
            CompressionOverride::Disable,
        ] {
            for call_default in [true, false] {
                assert!(!should_compress(false, message, call_default));
                assert_eq!(
                    should_compress(true, message, call_default),
                    message.resolve(call_default)
                );
            }
        }
    }
}
