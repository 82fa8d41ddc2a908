// Discovery tokens - portable, versioned peer bootstrap info
//
// Text form: "postmesh:" + base64url(version byte ++ postcard(payload)).
// The version byte is read before anything else, so a token from a newer
// release fails with UnsupportedVersion instead of garbage.

use crate::identity::{Keypair, NodeId, PublicKey};
use crate::peer::PeerInfo;
use crate::transport::{PeerAddress, TransportKind};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const TOKEN_PREFIX: &str = "postmesh:";
pub const TOKEN_VERSION_V1: u8 = 1;

/// Errors from decoding a discovery token
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TokenError {
    #[error("Token does not start with \"postmesh:\"")]
    MissingPrefix,

    #[error("Token is empty")]
    Empty,

    #[error("Token is not valid base64: {0}")]
    InvalidEncoding(String),

    #[error("Unsupported token version {0}")]
    UnsupportedVersion(u8),

    #[error("Malformed token payload: {0}")]
    Malformed(String),

    #[error("Token signature does not verify")]
    BadSignature,

    #[error("Token node id does not belong to its key")]
    IdentityMismatch,
}

/// Version 1 token contents
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenV1 {
    node_id: NodeId,
    host: String,
    port: u16,
    transport_kind: TransportKind,
    public_key: [u8; 32],
    shared_secret: Option<String>,
}

impl TokenV1 {
    fn signing_bytes(&self) -> Result<Vec<u8>, TokenError> {
        let mut bytes = b"postmesh-token:v1:".to_vec();
        bytes.extend(postcard::to_allocvec(self).map_err(|e| TokenError::Malformed(e.to_string()))?);
        Ok(bytes)
    }

    fn peer_info(&self) -> PeerInfo {
        let info = PeerInfo::new(
            self.node_id,
            PeerAddress::new(self.host.clone(), self.port),
            self.transport_kind,
        );
        match &self.shared_secret {
            Some(secret) => info.with_shared_secret(secret.clone()),
            None => info,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct SignedV1 {
    body: TokenV1,
    signature: Vec<u8>,
}

/// A decoded token, tagged by version
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DiscoveryToken {
    V1 { body: TokenV1, signature: Vec<u8> },
}

impl DiscoveryToken {
    /// Sign bootstrap info for `info`'s node
    ///
    /// The keypair must be the one the node id derives from.
    pub fn issue(info: &PeerInfo, keypair: &Keypair) -> Result<Self, TokenError> {
        let public_key = keypair.public_key();
        if NodeId::from_public_key(&public_key) != *info.peer_id() {
            return Err(TokenError::IdentityMismatch);
        }

        let body = TokenV1 {
            node_id: *info.peer_id(),
            host: info.address().host().to_string(),
            port: info.address().port(),
            transport_kind: info.transport_kind(),
            public_key: *public_key.as_bytes(),
            shared_secret: info.shared_secret().map(str::to_string),
        };
        let signature = keypair.sign(&body.signing_bytes()?);
        Ok(DiscoveryToken::V1 { body, signature })
    }

    pub fn version(&self) -> u8 {
        match self {
            DiscoveryToken::V1 { .. } => TOKEN_VERSION_V1,
        }
    }

    /// Render as text
    pub fn encode(&self) -> Result<String, TokenError> {
        let mut bytes = vec![self.version()];
        match self {
            DiscoveryToken::V1 { body, signature } => {
                let signed = SignedV1 {
                    body: body.clone(),
                    signature: signature.clone(),
                };
                bytes.extend(postcard::to_allocvec(&signed).map_err(|e| TokenError::Malformed(e.to_string()))?);
            }
        }
        Ok(format!("{}{}", TOKEN_PREFIX, URL_SAFE_NO_PAD.encode(bytes)))
    }

    /// Parse the text form without checking the signature
    pub fn decode(text: &str) -> Result<Self, TokenError> {
        let encoded = text
            .trim()
            .strip_prefix(TOKEN_PREFIX)
            .ok_or(TokenError::MissingPrefix)?;
        if encoded.is_empty() {
            return Err(TokenError::Empty);
        }

        let bytes = URL_SAFE_NO_PAD
            .decode(encoded)
            .map_err(|e| TokenError::InvalidEncoding(e.to_string()))?;
        let (&version, payload) = bytes.split_first().ok_or(TokenError::Empty)?;

        match version {
            TOKEN_VERSION_V1 => {
                let signed: SignedV1 =
                    postcard::from_bytes(payload).map_err(|e| TokenError::Malformed(e.to_string()))?;
                Ok(DiscoveryToken::V1 {
                    body: signed.body,
                    signature: signed.signature,
                })
            }
            other => Err(TokenError::UnsupportedVersion(other)),
        }
    }

    /// Check identity and signature, then return the peer info
    pub fn verify(&self) -> Result<PeerInfo, TokenError> {
        match self {
            DiscoveryToken::V1 { body, signature } => {
                let public_key =
                    PublicKey::from_bytes(&body.public_key).map_err(|e| TokenError::Malformed(e.to_string()))?;
                if NodeId::from_public_key(&public_key) != body.node_id {
                    return Err(TokenError::IdentityMismatch);
                }
                if !public_key.verify(&body.signing_bytes()?, signature) {
                    return Err(TokenError::BadSignature);
                }
                if body.host.is_empty() {
                    return Err(TokenError::Malformed("empty host".to_string()));
                }
                Ok(body.peer_info())
            }
        }
    }
}

/// Issue and encode a token in one step
pub fn generate_token(info: &PeerInfo, keypair: &Keypair) -> Result<String, TokenError> {
    DiscoveryToken::issue(info, keypair)?.encode()
}

/// Decode and verify a token in one step
pub fn parse_token(text: &str) -> Result<PeerInfo, TokenError> {
    DiscoveryToken::decode(text)?.verify()
}
