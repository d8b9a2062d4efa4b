use std::fmt;

/// Reply sent to an SMTP client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmtpReply {
    pub code: u16,
    /// Enhanced status code (RFC 3463), e.g. `5.5.0`
    pub enhanced: Option<&'static str>,
    pub message: String,
}

impl SmtpReply {
    pub fn new(code: u16, enhanced: Option<&'static str>, message: impl Into<String>) -> Self {
        SmtpReply {
            code,
            enhanced,
            message: message.into(),
        }
    }

    pub fn ok() -> Self {
        Self::new(250, Some("2.0.0"), "OK")
    }

    pub fn banned() -> Self {
        Self::new(554, Some("5.5.4"), "Your address has been banned")
    }

    pub fn no_user() -> Self {
        Self::new(550, Some("5.5.0"), "Mailbox unavailable")
    }

    pub fn greylisted() -> Self {
        Self::new(
            451,
            Some("4.5.1"),
            "You have been greylisted, try again a bit later.",
        )
    }

    pub fn local_error() -> Self {
        Self::new(451, Some("4.3.0"), "Local error, try again later")
    }

    pub fn sender_not_allowed() -> Self {
        Self::new(550, Some("5.7.1"), "Sender address not allowed for this account")
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self::new(554, Some("5.6.0"), message)
    }

    pub fn too_large(max: usize) -> Self {
        Self::new(
            552,
            Some("5.3.4"),
            format!("Message exceeds fixed maximum size of {} bytes", max),
        )
    }

    pub fn tls_required() -> Self {
        Self::new(530, Some("5.7.0"), "Must issue a STARTTLS command first")
    }

    pub fn bad_sequence() -> Self {
        Self::new(503, Some("5.5.1"), "Bad sequence of commands")
    }

    pub fn syntax_error() -> Self {
        Self::new(500, Some("5.5.2"), "Syntax error, command unrecognized")
    }

    pub fn not_implemented() -> Self {
        Self::new(502, Some("5.5.1"), "Command not implemented")
    }

    pub fn is_positive(&self) -> bool {
        self.code < 400
    }

    /// Wire form, CRLF terminated
    pub fn to_wire(&self) -> String {
        format!("{}\r\n", self)
    }
}

impl fmt::Display for SmtpReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.enhanced {
            Some(enhanced) => write!(f, "{} {} {}", self.code, enhanced, self.message),
            None => write!(f, "{} {}", self.code, self.message),
        }
    }
}

/// Outcome of a session step
pub type ReplyResult<T = ()> = std::result::Result<T, SmtpReply>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_format() {
        assert_eq!(
            SmtpReply::greylisted().to_wire(),
            "451 4.5.1 You have been greylisted, try again a bit later.\r\n"
        );
        assert_eq!(SmtpReply::new(221, None, "Bye").to_wire(), "221 Bye\r\n");
    }

    #[test]
    fn test_codes() {
        assert_eq!(SmtpReply::banned().code, 554);
        assert_eq!(SmtpReply::no_user().code, 550);
        assert_eq!(SmtpReply::too_large(10).code, 552);
        assert!(SmtpReply::ok().is_positive());
        assert!(!SmtpReply::local_error().is_positive());
    }
}
