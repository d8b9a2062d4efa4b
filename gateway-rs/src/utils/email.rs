use crate::error::{GatewayError, Result};

/// Basic email validation
pub fn validate_email(email: &str) -> Result<()> {
    if email.is_empty() {
        return Err(GatewayError::InvalidEmail("Email is empty".to_string()));
    }

    if email.len() > 254 {
        return Err(GatewayError::InvalidEmail("Email is too long".to_string()));
    }

    let parts: Vec<&str> = email.split('@').collect();
    if parts.len() != 2 {
        return Err(GatewayError::InvalidEmail(format!(
            "Invalid email format: {}",
            email
        )));
    }

    let local = parts[0];
    let domain = parts[1];

    if local.is_empty() || domain.is_empty() {
        return Err(GatewayError::InvalidEmail(
            "Email parts cannot be empty".to_string(),
        ));
    }

    if email
        .chars()
        .any(|c| c.is_whitespace() || c.is_control() || c == '<' || c == '>')
    {
        return Err(GatewayError::InvalidEmail(format!(
            "Forbidden characters in {}",
            email
        )));
    }

    if !domain.contains('.') || domain.starts_with('.') || domain.ends_with('.') {
        return Err(GatewayError::InvalidEmail(format!(
            "Invalid domain: {}",
            domain
        )));
    }

    Ok(())
}

pub fn address_valid(email: &str) -> bool {
    validate_email(email).is_ok()
}

/// Lower-cased local part of an address, or the whole input when there is no `@`
pub fn mailbox(email: &str) -> String {
    let local = match email.rsplit_once('@') {
        Some((local, _)) => local,
        None => email,
    };
    local.trim().to_lowercase()
}

/// Lower-cased domain part of an address
pub fn hostname(email: &str) -> Option<String> {
    email
        .rsplit_once('@')
        .map(|(_, host)| host.trim().to_lowercase())
        .filter(|host| !host.is_empty())
}
