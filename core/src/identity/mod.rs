// Identity: node key pair and derived peer id

mod keys;

pub use keys::IdentityKeys;

use crate::config::IdentityConfig;
use anyhow::Result;

/// Build the node identity described by the configuration.
///
/// An explicit secret wins over a seed; with neither, a fresh key is generated.
pub fn load_identity(config: &IdentityConfig) -> Result<IdentityKeys> {
    if let Some(secret) = &config.secret_key_hex {
        tracing::info!("🔑 Loaded identity from configured secret");
        return IdentityKeys::from_secret_hex(secret);
    }
    if let Some(seed) = config.seed {
        tracing::info!(seed, "🔑 Derived identity from seed");
        return IdentityKeys::from_seed(seed);
    }
    tracing::info!("🔑 Generating new identity");
    Ok(IdentityKeys::generate())
}
