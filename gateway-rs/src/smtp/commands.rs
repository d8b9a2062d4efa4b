use crate::error::{GatewayError, Result};

#[derive(Debug, Clone, PartialEq)]
pub enum SmtpCommand {
    Helo(String),
    Ehlo(String),
    /// Reverse path; empty for the null sender `<>`
    MailFrom(String),
    RcptTo(String),
    Data,
    Rset,
    Quit,
    Noop,
    Starttls,
    /// Mechanism and optional initial response
    Auth(String, Option<String>),
    Unknown(String),
}

impl SmtpCommand {
    pub fn parse(line: &str) -> Result<Self> {
        let line = line.trim();
        if line.is_empty() {
            return Err(GatewayError::SmtpProtocol("Empty command".to_string()));
        }

        let parts: Vec<&str> = line.splitn(2, ' ').collect();
        let command = parts[0].to_uppercase();
        let args = parts.get(1).map(|s| s.trim()).unwrap_or("");

        match command.as_str() {
            "HELO" => {
                if args.is_empty() {
                    return Err(GatewayError::SmtpProtocol("HELO requires domain".to_string()));
                }
                Ok(SmtpCommand::Helo(args.to_string()))
            }
            "EHLO" => {
                if args.is_empty() {
                    return Err(GatewayError::SmtpProtocol("EHLO requires domain".to_string()));
                }
                Ok(SmtpCommand::Ehlo(args.to_string()))
            }
            "MAIL" => Ok(SmtpCommand::MailFrom(Self::parse_path(args, "FROM:")?)),
            "RCPT" => {
                let to = Self::parse_path(args, "TO:")?;
                if to.is_empty() {
                    return Err(GatewayError::SmtpProtocol("Empty forward path".to_string()));
                }
                Ok(SmtpCommand::RcptTo(to))
            }
            "DATA" => Ok(SmtpCommand::Data),
            "RSET" => Ok(SmtpCommand::Rset),
            "QUIT" => Ok(SmtpCommand::Quit),
            "NOOP" => Ok(SmtpCommand::Noop),
            "STARTTLS" => Ok(SmtpCommand::Starttls),
            "AUTH" => {
                let mut words = args.split_whitespace();
                let mechanism = words
                    .next()
                    .ok_or_else(|| GatewayError::SmtpProtocol("AUTH requires mechanism".to_string()))?
                    .to_uppercase();
                let initial = words
                    .next()
                    .filter(|response| *response != "=")
                    .map(str::to_string);
                Ok(SmtpCommand::Auth(mechanism, initial))
            }
            _ => Ok(SmtpCommand::Unknown(command)),
        }
    }

    /// Parse `FROM:<path> [params]` / `TO:<path> [params]`; ESMTP parameters are ignored
    fn parse_path(args: &str, keyword: &str) -> Result<String> {
        if !args.to_uppercase().starts_with(keyword) {
            return Err(GatewayError::SmtpProtocol(format!(
                "Invalid syntax, expected {}<address>",
                keyword
            )));
        }

        let rest = args[keyword.len()..].trim_start();
        let path = if let Some(stripped) = rest.strip_prefix('<') {
            let end = stripped
                .find('>')
                .ok_or_else(|| GatewayError::SmtpProtocol("Unterminated path".to_string()))?;
            &stripped[..end]
        } else {
            rest.split_whitespace().next().unwrap_or("")
        };

        Ok(path.trim().to_string())
    }
}
