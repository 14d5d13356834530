/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
//! Pluggable authentication-bypass strategies. The signature and token
//! material comes from opaque injected sources; the strategies only know
//! how to present it to the device at the right point of the connect
//! sequence.

use std::sync::Arc;

use async_trait::async_trait;
use log::{info, warn};

use crate::error::Error;
use crate::fastboot::FastbootClient;
use crate::firehose::FirehoseClient;

/// Result of one auth hook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthOutcome {
    Ok,
    /// Privilege is downgraded but the session continues.
    RecoverableFailure(String),
    /// The connect sequence must abort.
    Fatal(String),
}

/// Source of Xiaomi bypass tokens. The server-side validation protocol
/// is vendor territory; this stays an opaque byte provider.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn token(&self) -> Option<Vec<u8>>;
}

#[derive(Clone, Default)]
pub enum AuthStrategy {
    #[default]
    None,
    /// Qualcomm VIP: SHA-256 digest table + RSA-2048 signature presented
    /// before `<configure>`.
    VipDigestSignature {
        digest_table: Vec<u8>,
        signature: Vec<u8>,
    },
    /// Pre-baked VIP blobs for a named platform.
    ChimeraPreset {
        platform: String,
        digest_table: Vec<u8>,
        signature: Vec<u8>,
    },
    /// Xiaomi EDL token, presented over fastboot OEM commands.
    Xiaomi { token_provider: Arc<dyn TokenProvider> },
    /// OnePlus engineering-mode unlock ritual.
    OnePlus,
}

impl std::fmt::Debug for AuthStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            AuthStrategy::None => "None",
            AuthStrategy::VipDigestSignature { .. } => "VipDigestSignature",
            AuthStrategy::ChimeraPreset { platform, .. } => {
                return write!(f, "ChimeraPreset({platform})");
            }
            AuthStrategy::Xiaomi { .. } => "Xiaomi",
            AuthStrategy::OnePlus => "OnePlus",
        };
        f.write_str(name)
    }
}

impl AuthStrategy {
    /// Runs before `<configure>` on a Firehose session.
    pub async fn pre_configure(&self, firehose: &mut FirehoseClient) -> AuthOutcome {
        match self {
            AuthStrategy::VipDigestSignature { digest_table, signature }
            | AuthStrategy::ChimeraPreset { digest_table, signature, .. } => {
                match firehose.vip_auth(digest_table, signature).await {
                    Ok(true) => AuthOutcome::Ok,
                    Ok(false) => AuthOutcome::RecoverableFailure(
                        "VIP signature rejected, continuing unprivileged".into(),
                    ),
                    Err(e @ Error::Disconnected(_)) => AuthOutcome::Fatal(e.to_string()),
                    Err(e) => AuthOutcome::RecoverableFailure(e.to_string()),
                }
            }
            _ => AuthOutcome::Ok,
        }
    }

    /// Runs after `<configure>` acknowledged.
    pub async fn post_configure(&self, _firehose: &mut FirehoseClient) -> AuthOutcome {
        match self {
            AuthStrategy::ChimeraPreset { platform, .. } => {
                info!("Chimera preset '{platform}' active");
                AuthOutcome::Ok
            }
            _ => AuthOutcome::Ok,
        }
    }

    /// Runs before flashing over Fastboot.
    pub async fn pre_flash(&self, fastboot: &mut FastbootClient) -> AuthOutcome {
        match self {
            AuthStrategy::Xiaomi { token_provider } => {
                let Some(token) = token_provider.token().await else {
                    return AuthOutcome::RecoverableFailure(
                        "no Xiaomi auth token available".into(),
                    );
                };

                match fastboot.oem(&format!("edl_auth {}", hex::encode(&token))).await {
                    Ok(_) => AuthOutcome::Ok,
                    Err(Error::Protocol(msg)) => {
                        warn!("Xiaomi token refused: {msg}");
                        AuthOutcome::RecoverableFailure(msg)
                    }
                    Err(e) => AuthOutcome::Fatal(e.to_string()),
                }
            }
            AuthStrategy::OnePlus => match fastboot.oem("demacia").await {
                Ok(_) => AuthOutcome::Ok,
                Err(Error::Protocol(msg)) => {
                    warn!("OnePlus unlock ritual refused: {msg}");
                    AuthOutcome::RecoverableFailure(msg)
                }
                Err(e) => AuthOutcome::Fatal(e.to_string()),
            },
            _ => AuthOutcome::Ok,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancelToken;
    use crate::timeouts::Timeouts;
    use crate::transport::mock::MockTransport;

    struct FixedToken(Option<Vec<u8>>);

    #[async_trait]
    impl TokenProvider for FixedToken {
        async fn token(&self) -> Option<Vec<u8>> {
            self.0.clone()
        }
    }

    fn fastboot(mock: MockTransport) -> FastbootClient {
        FastbootClient::new(Box::new(mock), Timeouts::default(), CancelToken::new())
    }

    #[tokio::test]
    async fn missing_xiaomi_token_is_recoverable() {
        let strategy = AuthStrategy::Xiaomi { token_provider: Arc::new(FixedToken(None)) };
        let mut fb = fastboot(MockTransport::new().loose());

        let outcome = strategy.pre_flash(&mut fb).await;
        assert!(matches!(outcome, AuthOutcome::RecoverableFailure(_)));
    }

    #[tokio::test]
    async fn accepted_token_is_ok() {
        let strategy = AuthStrategy::Xiaomi {
            token_provider: Arc::new(FixedToken(Some(vec![0xA5; 8]))),
        };
        let mock = MockTransport::new().loose().reply(b"OKAY");
        let mut fb = fastboot(mock);

        assert_eq!(strategy.pre_flash(&mut fb).await, AuthOutcome::Ok);
    }

    #[tokio::test]
    async fn refused_oneplus_ritual_downgrades() {
        let mock = MockTransport::new().loose().reply(b"FAILnot allowed");
        let mut fb = fastboot(mock);

        let outcome = AuthStrategy::OnePlus.pre_flash(&mut fb).await;
        assert!(matches!(outcome, AuthOutcome::RecoverableFailure(_)));
    }

    #[tokio::test]
    async fn none_strategy_is_always_ok() {
        let mut fb = fastboot(MockTransport::new().loose());
        assert_eq!(AuthStrategy::None.pre_flash(&mut fb).await, AuthOutcome::Ok);
    }
}
