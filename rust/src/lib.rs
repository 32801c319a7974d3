//! Protection for health records at rest.
//!
//! * [`crypto`] encrypts individual field values into self-describing
//!   `cbc:` / `gcm:` ciphertext strings and reads them back, tolerating
//!   legacy base64 values written before encryption existed.
//! * [`audit`] builds checksummed audit entries and seals them under the
//!   audit key.
//! * [`lockout`] counts failed logins per identity and locks accounts that
//!   exceed the policy.
//! * [`admin`] gates the emergency lockout overrides behind an admin token.

pub mod admin;
pub mod audit;
pub mod clock;
pub mod config;
pub mod crypto;
pub mod lockout;
pub mod logging;
