use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};

/// HTTP header carrying the vanilla xpub on every node request.
pub const HEADER_XPUB_VAN: &str = "xpub-van";
/// HTTP header carrying the colored xpub on every node request.
pub const HEADER_XPUB_COL: &str = "xpub-col";
/// HTTP header carrying the master fingerprint on every node request.
pub const HEADER_MASTER_FINGERPRINT: &str = "master-fingerprint";

/// The identity triple for a custodial wallet.
///
/// `xpub_vanilla` is the canonical wallet identifier in every durable table;
/// the other two fields ride along so any component holding an identity can
/// issue node requests without a lookup.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WalletIdentity {
    pub xpub_vanilla: String,
    pub xpub_colored: String,
    pub master_fingerprint: String,
}

impl WalletIdentity {
    pub fn new(
        xpub_vanilla: impl Into<String>,
        xpub_colored: impl Into<String>,
        master_fingerprint: impl Into<String>,
    ) -> Self {
        Self {
            xpub_vanilla: xpub_vanilla.into(),
            xpub_colored: xpub_colored.into(),
            master_fingerprint: master_fingerprint.into(),
        }
    }

    /// An abbreviated wallet id safe to include in every log line.
    pub fn short_id(&self) -> ShortWalletId<'_> {
        ShortWalletId(&self.xpub_vanilla)
    }
}

/// Renders an xpub as `abcde…vwxyz` so logs stay greppable without leaking
/// the full key into every line.
pub struct ShortWalletId<'a>(pub &'a str);

impl Display for ShortWalletId<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let xpub = self.0;
        if xpub.len() <= 10 {
            return write!(f, "{xpub}");
        }
        // Both slices are char-aligned; xpubs are base58.
        let head = &xpub[..5];
        let tail = &xpub[xpub.len() - 5..];
        write!(f, "{head}…{tail}")
    }
}
