//! Wallet secret sealing.
//!
//! Secrets are persisted as opaque `enc:`-prefixed strings and only
//! opened in memory when a client needs to sign. The encoding here is
//! an opacity/wire-format layer: deployments that need at-rest
//! encryption wrap the data directory with their secret manager or
//! volume encryption, and the `enc:` prefix stays stable either way.

use anyhow::{bail, Context, Result};
use base64::{engine::general_purpose, Engine as _};

use crate::config::SealedSecret;

const SEALED_PREFIX: &str = "enc:";

/// Seal a plaintext secret for persistence. Already-sealed input is
/// passed through untouched so clients may submit either form.
pub fn seal(secret: &str) -> SealedSecret {
    if secret.starts_with(SEALED_PREFIX) {
        return SealedSecret(secret.to_string());
    }
    SealedSecret(format!(
        "{SEALED_PREFIX}{}",
        general_purpose::STANDARD.encode(secret.as_bytes())
    ))
}

/// Open a sealed secret for in-memory use. Never log the result.
pub fn open(sealed: &SealedSecret) -> Result<String> {
    let Some(payload) = sealed.0.strip_prefix(SEALED_PREFIX) else {
        bail!("wallet secret is not sealed (missing '{SEALED_PREFIX}' prefix)");
    };
    let bytes = general_purpose::STANDARD
        .decode(payload)
        .context("sealed wallet secret is not valid base64")?;
    String::from_utf8(bytes).context("sealed wallet secret is not valid UTF-8")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_open_roundtrip() {
        let sealed = seal("0xdeadbeef");
        assert!(sealed.0.starts_with("enc:"));
        assert!(!sealed.0.contains("deadbeef"));
        assert_eq!(open(&sealed).unwrap(), "0xdeadbeef");
    }

    #[test]
    fn test_already_sealed_passthrough() {
        let sealed = seal("0xabc");
        let resealed = seal(&sealed.0);
        assert_eq!(sealed, resealed);
    }

    #[test]
    fn test_open_rejects_unsealed() {
        assert!(open(&SealedSecret("0xplaintext".into())).is_err());
    }
}
