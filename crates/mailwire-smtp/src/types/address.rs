//! Envelope addresses.

use crate::error::{Error, Result};

/// Envelope path for MAIL FROM or RCPT TO.
///
/// Only the checks the wire format needs are applied: the address must fit
/// between angle brackets on a single command line. Mailbox syntax beyond
/// that is the caller's business.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Address(String);

impl Address {
    /// Creates a new address from a string.
    ///
    /// # Errors
    ///
    /// Returns an error if the address is empty or cannot be written inside
    /// `<...>` on a command line.
    pub fn new(addr: impl Into<String>) -> Result<Self> {
        let addr = addr.into();
        Self::validate(&addr)?;
        Ok(Self(addr))
    }

    /// The null reverse path `<>`, used for bounces.
    #[must_use]
    pub const fn null() -> Self {
        Self(String::new())
    }

    /// Returns true for the null reverse path.
    #[must_use]
    pub fn is_null(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns the address as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn validate(addr: &str) -> Result<()> {
        if addr.is_empty() {
            return Err(Error::InvalidAddress(
                "Address cannot be empty; use Address::null() for <>".into(),
            ));
        }

        let mut quoted = false;
        for c in addr.chars() {
            match c {
                '"' => quoted = !quoted,
                '<' | '>' if !quoted => {
                    return Err(Error::InvalidAddress(format!(
                        "Angle brackets are not allowed: {addr}"
                    )));
                }
                c if c.is_control() => {
                    return Err(Error::InvalidAddress(
                        "Control characters are not allowed".into(),
                    ));
                }
                c if c.is_whitespace() && !quoted => {
                    return Err(Error::InvalidAddress(format!(
                        "Unquoted whitespace in address: {addr}"
                    )));
                }
                _ => {}
            }
        }

        Ok(())
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<{}>", self.0)
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::redundant_clone,
    clippy::manual_string_new,
    clippy::needless_collect,
    clippy::unreadable_literal,
    clippy::used_underscore_items,
    clippy::similar_names
)]
mod tests {
    use super::*;

    #[test]
    fn accepts_plain_and_local_only_paths() {
        assert_eq!(Address::new("user@example.com").unwrap().as_str(), "user@example.com");
        assert!(Address::new("postmaster").is_ok());
        assert!(Address::new("\"john doe\"@example.com").is_ok());
    }

    #[test]
    fn rejects_what_breaks_the_command_line() {
        assert!(Address::new("").is_err());
        assert!(Address::new("a@b\r\nRCPT TO:<evil@x>").is_err());
        assert!(Address::new("a>b@example.com").is_err());
        assert!(Address::new("john doe@example.com").is_err());
    }

    #[test]
    fn null_path() {
        let null = Address::null();
        assert!(null.is_null());
        assert_eq!(null.to_string(), "<>");
        assert_eq!(Address::new("a@b").unwrap().to_string(), "<a@b>");
    }
}
