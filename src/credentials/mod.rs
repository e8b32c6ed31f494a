//! # Credentials
//!
//! - `codec`: at-rest encryption of database passwords
//! - `password`: generation of new database passwords

pub mod codec;
pub mod password;

pub use codec::{CodecError, CodecResult, CredentialCodec};
pub use password::{generate_password, DEFAULT_PASSWORD_LENGTH};
