//! Who gets in, under what name, and who gets to talk.
//!
//! This crate handles everything that happens to a peer before and around
//! routing:
//!
//! 1. **Login**: the challenge/response handshake every quarantined
//!    socket runs ([`ClientLogin`], [`ServerLogin`]), with pluggable
//!    policies ([`LoginValidator`], [`CredentialProvider`]) and a
//!    ready-made shared-password policy ([`PasswordValidator`]).
//! 2. **Names**: display names are normalized and made unique
//!    ([`unique_name`], [`real_name`]).
//! 3. **Moderation**: mutes and mini-bans with optional expiry
//!    ([`Moderation`], [`MuteStore`]).
//!
//! # How it fits in the stack
//!
//! ```text
//! Messenger (above)  ← runs the login on accept, checks moderation on routing
//!     ↕
//! Session (this crate)
//!     ↕
//! Transport (below)  ← provides the framed stream the login talks over
//! ```

mod error;
mod login;
mod moderation;
pub mod names;
mod password;

pub use error::SessionError;
pub use login::{
    Admitted, ClientLogin, CredentialProvider, HARDWARE_ADDRESS_KEY, LoginFrame, LoginRequest,
    LoginValidator, Properties, ServerLogin,
};
pub use moderation::{Moderation, MuteStore, NoMuteStore, RECENT_DEPARTURES};
pub use names::{real_name, unique_name};
pub use password::{INVALID_PASSWORD, PasswordCredentials, PasswordValidator};
