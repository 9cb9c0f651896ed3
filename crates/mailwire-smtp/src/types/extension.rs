//! SMTP service extensions, as advertised in an EHLO reply.

use std::fmt;

/// A service extension keyword with its parameters.
///
/// Servers format these into EHLO reply lines through [`fmt::Display`];
/// clients recover them with [`Extension::parse`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Extension {
    /// STARTTLS - TLS upgrade (RFC 3207)
    StartTls,
    /// AUTH - Authentication (RFC 4954)
    Auth(Vec<AuthMechanism>),
    /// SIZE - Maximum message size (RFC 1870)
    Size(Option<u64>),
    /// 8BITMIME - 8-bit MIME transport
    EightBitMime,
    /// PIPELINING - Command pipelining (RFC 2920)
    Pipelining,
    /// CHUNKING - BDAT transfer (RFC 3030)
    Chunking,
    /// BINARYMIME - Binary MIME (RFC 3030)
    BinaryMime,
    /// ENHANCEDSTATUSCODES - RFC 2034
    EnhancedStatusCodes,
    /// SMTPUTF8 - UTF-8 email addresses
    SmtpUtf8,
    /// REQUIRETLS - TLS required for onward relay (RFC 8689)
    RequireTls,
    /// Unknown extension, kept verbatim
    Unknown(String),
}

impl Extension {
    /// Parses an extension line from EHLO response.
    #[must_use]
    pub fn parse(line: &str) -> Self {
        let mut parts = line.split_whitespace();
        let Some(keyword) = parts.next() else {
            return Self::Unknown(line.to_string());
        };

        match keyword.to_ascii_uppercase().as_str() {
            "STARTTLS" => Self::StartTls,
            "AUTH" => Self::Auth(parts.filter_map(AuthMechanism::parse).collect()),
            "SIZE" => Self::Size(parts.next().and_then(|s| s.parse().ok())),
            "8BITMIME" => Self::EightBitMime,
            "PIPELINING" => Self::Pipelining,
            "CHUNKING" => Self::Chunking,
            "BINARYMIME" => Self::BinaryMime,
            "ENHANCEDSTATUSCODES" => Self::EnhancedStatusCodes,
            "SMTPUTF8" => Self::SmtpUtf8,
            "REQUIRETLS" => Self::RequireTls,
            _ => Self::Unknown(line.to_string()),
        }
    }

    /// Returns true if both values name the same extension keyword,
    /// ignoring parameters.
    #[must_use]
    pub fn same_keyword(&self, other: &Self) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }
}

impl fmt::Display for Extension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StartTls => f.write_str("STARTTLS"),
            Self::Auth(mechanisms) => {
                f.write_str("AUTH")?;
                for mechanism in mechanisms {
                    write!(f, " {}", mechanism.as_str())?;
                }
                Ok(())
            }
            Self::Size(Some(limit)) => write!(f, "SIZE {limit}"),
            Self::Size(None) => f.write_str("SIZE"),
            Self::EightBitMime => f.write_str("8BITMIME"),
            Self::Pipelining => f.write_str("PIPELINING"),
            Self::Chunking => f.write_str("CHUNKING"),
            Self::BinaryMime => f.write_str("BINARYMIME"),
            Self::EnhancedStatusCodes => f.write_str("ENHANCEDSTATUSCODES"),
            Self::SmtpUtf8 => f.write_str("SMTPUTF8"),
            Self::RequireTls => f.write_str("REQUIRETLS"),
            Self::Unknown(line) => f.write_str(line),
        }
    }
}

/// SASL authentication mechanism.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthMechanism {
    /// PLAIN - plaintext authentication
    Plain,
    /// LOGIN - legacy plaintext
    Login,
    /// CRAM-MD5 - challenge-response
    CramMd5,
    /// `XOAUTH2` - `OAuth2` (Google/Microsoft)
    XOAuth2,
    /// `OAUTHBEARER` - RFC 7628 `OAuth2`
    OAuthBearer,
}

impl AuthMechanism {
    /// Parses an authentication mechanism name.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "PLAIN" => Some(Self::Plain),
            "LOGIN" => Some(Self::Login),
            "CRAM-MD5" => Some(Self::CramMd5),
            "XOAUTH2" => Some(Self::XOAuth2),
            "OAUTHBEARER" => Some(Self::OAuthBearer),
            _ => None,
        }
    }

    /// Returns the mechanism name as a string.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Plain => "PLAIN",
            Self::Login => "LOGIN",
            Self::CramMd5 => "CRAM-MD5",
            Self::XOAuth2 => "XOAUTH2",
            Self::OAuthBearer => "OAUTHBEARER",
        }
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
    fn parse_keywords_case_insensitively() {
        assert_eq!(Extension::parse("pipelining"), Extension::Pipelining);
        assert_eq!(Extension::parse("CHUNKING"), Extension::Chunking);
        assert_eq!(
            Extension::parse("EnhancedStatusCodes"),
            Extension::EnhancedStatusCodes
        );
        assert_eq!(Extension::parse("BINARYMIME"), Extension::BinaryMime);
    }

    #[test]
    fn parse_size() {
        assert_eq!(Extension::parse("SIZE 35882577"), Extension::Size(Some(35_882_577)));
        assert_eq!(Extension::parse("SIZE"), Extension::Size(None));
        assert_eq!(Extension::parse("SIZE lots"), Extension::Size(None));
    }

    #[test]
    fn parse_auth_skips_unknown_mechanisms() {
        assert_eq!(
            Extension::parse("AUTH PLAIN SCRAM-SHA-256 LOGIN"),
            Extension::Auth(vec![AuthMechanism::Plain, AuthMechanism::Login])
        );
    }

    #[test]
    fn parse_unknown_keeps_line() {
        assert_eq!(
            Extension::parse("LIMITS RCPTMAX=100"),
            Extension::Unknown("LIMITS RCPTMAX=100".into())
        );
        assert!(matches!(Extension::parse("   "), Extension::Unknown(_)));
    }

    #[test]
    fn display_round_trips_through_parse() {
        let advertised = [
            Extension::Pipelining,
            Extension::Chunking,
            Extension::Size(Some(1024)),
            Extension::Auth(vec![AuthMechanism::Plain, AuthMechanism::XOAuth2]),
            Extension::SmtpUtf8,
            Extension::RequireTls,
        ];
        for ext in advertised {
            assert_eq!(Extension::parse(&ext.to_string()), ext);
        }
        assert_eq!(Extension::Auth(vec![]).to_string(), "AUTH");
    }

    #[test]
    fn same_keyword_ignores_parameters() {
        assert!(Extension::Size(Some(1)).same_keyword(&Extension::Size(None)));
        assert!(!Extension::Size(None).same_keyword(&Extension::Chunking));
    }

    #[test]
    fn auth_mechanism_names() {
        assert_eq!(AuthMechanism::parse("cram-md5"), Some(AuthMechanism::CramMd5));
        assert_eq!(AuthMechanism::parse("GSSAPI"), None);
        assert_eq!(AuthMechanism::OAuthBearer.as_str(), "OAUTHBEARER");
    }
}
