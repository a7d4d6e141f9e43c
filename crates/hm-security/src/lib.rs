//! Security hooks: authenticated encryption, signing, authentication and
//! authorization contracts with default implementations.

pub mod auth;
pub mod encryption;
pub mod signing;

pub use auth::{
    Authenticator, AuthorizationError, Authorizer, Claim, ClaimsAuthorizer, Credentials,
    Principal, StaticTokenAuthenticator,
};
pub use encryption::{
    AesGcmEncryptor, EncryptedPayload, EncryptionError, MessageEncryptor, SecurityContext,
};
pub use signing::{HmacSigner, MessageSigner, Signature, SigningError};
